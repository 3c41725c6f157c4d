//! Account and call orchestration.
//!
//! This module owns the session graph — accounts, their calls, and the
//! registry both live in — together with the serialized command processor
//! that is the only writer of that graph. See [`processor`] for the
//! concurrency model and [`command`] for the submission surface.

pub mod account;
pub mod call;
pub mod command;
pub mod config;
pub mod processor;
pub mod registry;

#[cfg(test)]
mod tests;

pub use account::AccountSession;
pub use call::{CallDirection, CallSession};
pub use command::{Command, ProcessorHandle};
pub use config::{AccountConfig, AccountTransport, AuthScheme, SrtpPolicy};
pub use processor::{CommandProcessor, SessionContext};
pub use registry::SessionRegistry;
