//! Process-wide session registry.
//!
//! The registry is the single point of truth for which accounts and calls
//! currently exist: a concurrent map from account identity URI to
//! [`AccountSession`]. All mutation happens on the command processor's
//! worker, but lookups may run concurrently from engine callback contexts,
//! so the map is a sharded concurrent structure rather than a plain
//! `HashMap`.
//!
//! Access goes through closure-based helpers; shard guards therefore never
//! escape and can never be held across await points.

use dashmap::DashMap;

use crate::client::account::AccountSession;
use crate::client::call::CallSession;
use crate::engine::CallId;

/// Concurrent map of account identity URI to [`AccountSession`].
#[derive(Default)]
pub struct SessionRegistry {
    accounts: DashMap<String, AccountSession>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an account with this identity exists.
    pub fn contains(&self, account_id: &str) -> bool {
        self.accounts.contains_key(account_id)
    }

    /// Registers a session under its identity URI, replacing any previous
    /// session for the same identity.
    pub fn insert(&self, session: AccountSession) {
        self.accounts.insert(session.id_uri(), session);
    }

    /// Removes and returns a session. `None` if the identity is unknown.
    pub fn remove(&self, account_id: &str) -> Option<AccountSession> {
        self.accounts.remove(account_id).map(|(_, session)| session)
    }

    /// Identity URIs of all registered accounts (unordered).
    pub fn account_ids(&self) -> Vec<String> {
        self.accounts.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered accounts.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Whether no accounts are registered.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Total number of live calls across all accounts.
    pub fn total_calls(&self) -> usize {
        self.accounts.iter().map(|entry| entry.call_count()).sum()
    }

    /// Whether any guest session is currently registered.
    pub fn has_guest(&self) -> bool {
        self.accounts.iter().any(|entry| entry.is_guest())
    }

    /// Runs a closure against an account session, if it exists.
    pub fn with_account<R>(
        &self,
        account_id: &str,
        f: impl FnOnce(&AccountSession) -> R,
    ) -> Option<R> {
        self.accounts.get(account_id).map(|session| f(&session))
    }

    /// Runs a closure against a mutable account session, if it exists.
    pub fn with_account_mut<R>(
        &self,
        account_id: &str,
        f: impl FnOnce(&mut AccountSession) -> R,
    ) -> Option<R> {
        self.accounts.get_mut(account_id).map(|mut session| f(&mut session))
    }

    /// Runs a closure against a call, if both account and call exist.
    pub fn with_call<R>(
        &self,
        account_id: &str,
        call_id: CallId,
        f: impl FnOnce(&CallSession) -> R,
    ) -> Option<R> {
        self.accounts
            .get(account_id)
            .and_then(|session| session.call(call_id).map(f))
    }

    /// Runs a closure against a mutable call, if both account and call exist.
    pub fn with_call_mut<R>(
        &self,
        account_id: &str,
        call_id: CallId,
        f: impl FnOnce(&mut CallSession) -> R,
    ) -> Option<R> {
        self.accounts
            .get_mut(account_id)
            .and_then(|mut session| session.call_mut(call_id).map(f))
    }

    /// Removes every session, returning them for teardown.
    pub fn drain(&self) -> Vec<AccountSession> {
        let ids = self.account_ids();
        ids.into_iter().filter_map(|id| self.remove(&id)).collect()
    }
}
