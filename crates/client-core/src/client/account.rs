//! Per-account session state.
//!
//! An [`AccountSession`] wraps one [`AccountConfig`] together with the set of
//! live calls keyed by their engine-assigned call id. Sessions are owned
//! exclusively by the [`crate::client::SessionRegistry`]; they are destroyed
//! when the account is removed or the registry is torn down. Guest sessions
//! additionally tear themselves down when their only call disconnects.

use std::collections::HashMap;

use crate::client::call::CallSession;
use crate::client::config::AccountConfig;
use crate::engine::CallId;

/// One configured (or guest) account and its live calls.
#[derive(Debug)]
pub struct AccountSession {
    config: AccountConfig,
    calls: HashMap<CallId, CallSession>,
    guest: bool,
}

impl AccountSession {
    /// Creates a session for a configured account.
    pub fn new(config: AccountConfig) -> Self {
        Self { config, calls: HashMap::new(), guest: false }
    }

    /// Creates a throwaway guest session (no registration, destroyed with
    /// its call).
    pub fn new_guest(config: AccountConfig) -> Self {
        Self { config, calls: HashMap::new(), guest: true }
    }

    /// The account's configuration.
    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    /// Mutable access for registration-parameter updates.
    pub(crate) fn config_mut(&mut self) -> &mut AccountConfig {
        &mut self.config
    }

    /// Identity URI of this account.
    pub fn id_uri(&self) -> String {
        self.config.id_uri()
    }

    /// Whether this is a guest session.
    pub fn is_guest(&self) -> bool {
        self.guest
    }

    /// Looks up a call by id.
    pub fn call(&self, call_id: CallId) -> Option<&CallSession> {
        self.calls.get(&call_id)
    }

    /// Mutable lookup of a call by id.
    pub(crate) fn call_mut(&mut self, call_id: CallId) -> Option<&mut CallSession> {
        self.calls.get_mut(&call_id)
    }

    /// Ids of the currently tracked calls (unordered).
    pub fn call_ids(&self) -> Vec<CallId> {
        self.calls.keys().copied().collect()
    }

    /// Number of currently tracked calls.
    pub fn call_count(&self) -> usize {
        self.calls.len()
    }

    /// Registers a call under its id.
    pub(crate) fn insert_call(&mut self, call: CallSession) {
        self.calls.insert(call.id(), call);
    }

    /// Detaches a call; returns `None` when it was already removed, which
    /// makes the disconnection path idempotent.
    pub(crate) fn remove_call(&mut self, call_id: CallId) -> Option<CallSession> {
        self.calls.remove(&call_id)
    }
}
