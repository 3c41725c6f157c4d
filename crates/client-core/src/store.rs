//! Persisted configuration.
//!
//! Accounts, the codec priority table and a handful of scalar flags survive
//! restarts through an external key/value storage capability. Credentials can
//! be transparently encrypted with an external crypto capability; enabling or
//! disabling encryption migrates every stored account in place.
//!
//! Reads and writes are infrequent compared to call traffic, so the whole
//! helper is guarded by one coarse mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, error};

use crate::client::config::AccountConfig;
use crate::codec::CodecPriority;
use crate::error::ClientResult;

/// Error raised by the key/value storage capability.
#[derive(Debug, Clone, Error)]
#[error("store failure: {0}")]
pub struct StoreError(pub String);

/// Result type alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error raised by the crypto capability.
#[derive(Debug, Clone, Error)]
#[error("crypto failure: {0}")]
pub struct CryptoError(pub String);

/// Result type alias for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// External persistent key/value storage.
pub trait KeyValueStore: Send + Sync {
    /// Reads a value.
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    /// Writes a value.
    fn put(&self, key: &str, value: &str) -> StoreResult<()>;
    /// Deletes a value.
    fn remove(&self, key: &str) -> StoreResult<()>;
}

/// External string encryption.
pub trait Crypto: Send + Sync {
    /// Encrypts a plaintext string.
    fn encrypt(&self, plaintext: &str) -> CryptoResult<String>;
    /// Decrypts a previously encrypted string.
    fn decrypt(&self, ciphertext: &str) -> CryptoResult<String>;
}

/// In-memory [`KeyValueStore`], used in tests and ephemeral embeddings.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> StoreResult<()> {
        self.entries.lock().unwrap().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

mod keys {
    pub const ACCOUNTS: &str = "accounts";
    pub const CODEC_PRIORITIES: &str = "codec_priorities";
    pub const DND: &str = "dnd_pref";
    pub const ENCRYPTION_ENABLED: &str = "encryption_enabled";
    pub const KEYSTORE_ALIAS: &str = "keystore_alias";
    pub const OBFUSCATION_ENABLED: &str = "obfuscation_enabled";
    pub const VERIFY_SERVER_CERT: &str = "sip_server_cert_verification_enabled";
}

struct ConfigStoreInner {
    store: Arc<dyn KeyValueStore>,
    crypto: Option<Arc<dyn Crypto>>,
}

/// Persistence helper for accounts, codec priorities and flags.
///
/// Account records are serialized as one JSON list under a single key, the
/// codec table likewise; flags are stored as `"true"`/`"false"` strings.
/// When encryption is enabled every record's username and password are
/// encrypted before serialization; each record is deep-copied first so the
/// in-memory originals stay in the clear.
pub struct ConfigStore {
    inner: Mutex<ConfigStoreInner>,
}

impl ConfigStore {
    /// Creates a store helper without a crypto capability.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { inner: Mutex::new(ConfigStoreInner { store, crypto: None }) }
    }

    /// Creates a store helper that can encrypt credentials.
    pub fn with_crypto(store: Arc<dyn KeyValueStore>, crypto: Arc<dyn Crypto>) -> Self {
        Self { inner: Mutex::new(ConfigStoreInner { store, crypto: Some(crypto) }) }
    }

    /// Loads the configured accounts, decrypting credentials if needed.
    pub fn accounts(&self) -> ClientResult<Vec<AccountConfig>> {
        let inner = self.inner.lock().unwrap();
        Self::load_accounts(&inner)
    }

    /// Persists the configured accounts, replacing the stored list.
    pub fn persist_accounts(&self, accounts: &[AccountConfig]) -> ClientResult<()> {
        let inner = self.inner.lock().unwrap();
        Self::write_accounts(&inner, accounts, Self::encryption_flag(&inner))
    }

    /// Loads the persisted codec table, `None` if nothing was persisted yet.
    pub fn codec_priorities(&self) -> ClientResult<Option<Vec<CodecPriority>>> {
        let inner = self.inner.lock().unwrap();
        let raw = inner.store.get(keys::CODEC_PRIORITIES)?;
        match raw {
            None => Ok(None),
            Some(json) if json.is_empty() => Ok(None),
            Some(json) => {
                let table: Vec<CodecPriority> = serde_json::from_str(&json)
                    .map_err(|e| StoreError(format!("corrupt codec table: {e}")))?;
                Ok(Some(table))
            }
        }
    }

    /// Persists the codec table.
    pub fn persist_codec_priorities(&self, table: &[CodecPriority]) -> ClientResult<()> {
        let inner = self.inner.lock().unwrap();
        let json = serde_json::to_string(table)
            .map_err(|e| StoreError(format!("serialize codec table: {e}")))?;
        inner.store.put(keys::CODEC_PRIORITIES, &json)?;
        Ok(())
    }

    /// Current do-not-disturb flag, false by default.
    pub fn is_dnd(&self) -> bool {
        self.read_flag(keys::DND)
    }

    /// Sets the do-not-disturb flag.
    pub fn set_dnd(&self, dnd: bool) -> ClientResult<()> {
        self.write_flag(keys::DND, dnd)
    }

    /// Whether log obfuscation is enabled, false by default.
    pub fn is_obfuscation_enabled(&self) -> bool {
        self.read_flag(keys::OBFUSCATION_ENABLED)
    }

    /// Sets the log obfuscation flag.
    pub fn set_obfuscation(&self, enabled: bool) -> ClientResult<()> {
        self.write_flag(keys::OBFUSCATION_ENABLED, enabled)
    }

    /// Whether TLS server certificate verification is enabled.
    pub fn is_verify_server_cert(&self) -> bool {
        self.read_flag(keys::VERIFY_SERVER_CERT)
    }

    /// Sets the TLS server certificate verification flag.
    pub fn set_verify_server_cert(&self, verify: bool) -> ClientResult<()> {
        self.write_flag(keys::VERIFY_SERVER_CERT, verify)
    }

    /// Whether credential encryption is enabled.
    pub fn is_encryption_enabled(&self) -> bool {
        self.read_flag(keys::ENCRYPTION_ENABLED)
    }

    /// The configured keystore alias, if any.
    pub fn keystore_alias(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.store.get(keys::KEYSTORE_ALIAS).ok().flatten()
    }

    /// Enables or disables credential encryption and migrates the stored
    /// accounts: every record is re-persisted with its username and password
    /// re-encoded for the new mode; no other field changes.
    ///
    /// Enabling requires a crypto capability to have been supplied.
    pub fn set_encryption(&self, enabled: bool, alias: &str) -> ClientResult<()> {
        let inner = self.inner.lock().unwrap();

        if enabled && inner.crypto.is_none() {
            return Err(CryptoError("no crypto capability configured".to_string()).into());
        }

        // Read with the current mode before flipping the flag.
        let accounts = Self::load_accounts(&inner)?;

        inner.store.put(keys::ENCRYPTION_ENABLED, if enabled { "true" } else { "false" })?;
        inner.store.put(keys::KEYSTORE_ALIAS, alias)?;

        Self::write_accounts(&inner, &accounts, enabled)?;
        debug!(enabled, "credential encryption migrated");
        Ok(())
    }

    fn encryption_flag(inner: &ConfigStoreInner) -> bool {
        matches!(inner.store.get(keys::ENCRYPTION_ENABLED), Ok(Some(v)) if v == "true")
    }

    fn load_accounts(inner: &ConfigStoreInner) -> ClientResult<Vec<AccountConfig>> {
        let raw = inner.store.get(keys::ACCOUNTS)?;
        let json = match raw {
            None => return Ok(Vec::new()),
            Some(json) if json.is_empty() || json == "[]" => return Ok(Vec::new()),
            Some(json) => json,
        };

        let mut accounts: Vec<AccountConfig> = serde_json::from_str(&json)
            .map_err(|e| StoreError(format!("corrupt account list: {e}")))?;

        if Self::encryption_flag(inner) {
            let crypto = inner
                .crypto
                .as_ref()
                .ok_or_else(|| CryptoError("no crypto capability configured".to_string()))?;
            for account in &mut accounts {
                account.username = crypto.decrypt(&account.username)?;
                account.password = crypto.decrypt(&account.password)?;
            }
        }

        Ok(accounts)
    }

    fn write_accounts(
        inner: &ConfigStoreInner,
        accounts: &[AccountConfig],
        encrypt: bool,
    ) -> ClientResult<()> {
        // Clone, mutate the clone, persist the clone: the caller's records
        // must keep their plaintext credentials.
        let mut records: Vec<AccountConfig> = accounts.to_vec();

        if encrypt {
            let crypto = inner
                .crypto
                .as_ref()
                .ok_or_else(|| CryptoError("no crypto capability configured".to_string()))?;
            for record in &mut records {
                record.username = crypto.encrypt(&record.username)?;
                record.password = crypto.encrypt(&record.password)?;
            }
        }

        let json = serde_json::to_string(&records)
            .map_err(|e| StoreError(format!("serialize account list: {e}")))?;
        inner.store.put(keys::ACCOUNTS, &json)?;
        Ok(())
    }

    fn read_flag(&self, key: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.store.get(key) {
            Ok(Some(value)) => value == "true",
            Ok(None) => false,
            Err(e) => {
                error!(key, error = %e, "flag read failed, assuming false");
                false
            }
        }
    }

    fn write_flag(&self, key: &str, value: bool) -> ClientResult<()> {
        let inner = self.inner.lock().unwrap();
        inner.store.put(key, if value { "true" } else { "false" })?;
        Ok(())
    }
}
