//! Error types for the orchestration layer
//!
//! Nothing in this crate throws across the command boundary: command handlers
//! absorb their own failures into notifications, and the error values defined
//! here only travel between internal layers (and out of the synchronous
//! validation performed by [`crate::client::ProcessorHandle`] before a
//! command is enqueued).

use thiserror::Error;

use crate::engine::{CallId, EngineError};
use crate::store::{CryptoError, StoreError};

/// Result type alias for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors produced by the account/call orchestration layer.
///
/// The variants follow the failure taxonomy of the layer: missing
/// accounts/calls, malformed identifiers rejected before enqueuing,
/// protocol-engine failures, and persistence/crypto failures.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Referenced account does not exist in the session registry
    #[error("account not found: {account_id}")]
    AccountNotFound {
        /// Identity URI of the missing account
        account_id: String,
    },

    /// Referenced call does not exist (anymore) on the account
    #[error("call {call_id} not found on account {account_id}")]
    CallNotFound {
        /// Identity URI of the owning account
        account_id: String,
        /// Engine-assigned call identifier
        call_id: CallId,
    },

    /// Account identifier does not match the canonical `sip:user@host` shape
    #[error("invalid account id: {0} (example: sip:user@domain)")]
    InvalidAccountId(String),

    /// The protocol engine has not been started yet
    #[error("sip stack is not started")]
    StackNotStarted,

    /// A call into the protocol engine failed
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Persistent key/value storage failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Encrypting or decrypting persisted credentials failed
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Anything that does not fit the categories above
    #[error("internal error: {message}")]
    Internal {
        /// Human readable description
        message: String,
    },
}

impl ClientError {
    /// Shorthand for an [`ClientError::Internal`] error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }
}
