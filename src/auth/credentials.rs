// Credential persistence
// Owns the stored token/user entries and the current-user change stream

use std::sync::{Mutex, PoisonError, RwLock};

use tokio::sync::watch;

use super::types::UserRecord;
use crate::error::AuthError;
use crate::storage::{MemoryStorage, Storage};

/// Storage key for the raw bearer token
pub const TOKEN_KEY: &str = "token";

/// Storage key for the JSON user record
pub const USER_KEY: &str = "currentUser";

/// Persists the access token and current user.
///
/// Storage failures never reach callers: the store logs them, swaps the
/// backend for [`MemoryStorage`] and carries on for the rest of the process.
/// Every user change is published on a `watch` channel, so new subscribers
/// always see the latest value first.
pub struct CredentialStore {
    storage: RwLock<Box<dyn Storage>>,
    user_tx: watch::Sender<Option<UserRecord>>,
    /// Serialises writes that touch both entries
    write_lock: Mutex<()>,
}

impl CredentialStore {
    /// Wrap a storage backend and publish whatever user it already holds
    pub fn new(storage: Box<dyn Storage>) -> Self {
        let (user_tx, _) = watch::channel(None);
        let store = Self {
            storage: RwLock::new(storage),
            user_tx,
            write_lock: Mutex::new(()),
        };

        let restored = store.get_user();
        if let Some(ref user) = restored {
            tracing::info!(user_id = user.id, "Restored stored session user");
        }
        store.user_tx.send_replace(restored);
        store
    }

    /// Store with no durable backing
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStorage::new()))
    }

    pub fn save_token(&self, token: &str) {
        let _guard = self.write_guard();
        self.with_storage(|s| s.set(TOKEN_KEY, token));
    }

    pub fn get_token(&self) -> Option<String> {
        self.with_storage(|s| s.get(TOKEN_KEY)).flatten()
    }

    pub fn clear_token(&self) {
        let _guard = self.write_guard();
        self.with_storage(|s| s.remove(TOKEN_KEY));
    }

    /// Persist the user and publish it to subscribers
    pub fn save_user(&self, user: &UserRecord) {
        let _guard = self.write_guard();
        self.write_user(user);
        self.user_tx.send_replace(Some(user.clone()));
    }

    /// Read the stored user; a record that fails to parse is purged and treated as absent
    pub fn get_user(&self) -> Option<UserRecord> {
        let raw = self.with_storage(|s| s.get(USER_KEY)).flatten()?;
        match serde_json::from_str::<UserRecord>(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                let err = AuthError::CorruptedPersistedState(e.to_string());
                tracing::warn!("{}, clearing stored user", err);
                self.with_storage(|s| s.remove(USER_KEY));
                None
            }
        }
    }

    /// Store token and user together, then publish once
    pub fn save_session(&self, token: &str, user: &UserRecord) {
        let _guard = self.write_guard();
        self.with_storage(|s| s.set(TOKEN_KEY, token));
        self.write_user(user);
        self.user_tx.send_replace(Some(user.clone()));
    }

    /// Remove token and user, then publish `None` once
    pub fn clear(&self) {
        let _guard = self.write_guard();
        self.with_storage(|s| s.remove(TOKEN_KEY));
        self.with_storage(|s| s.remove(USER_KEY));
        self.user_tx.send_replace(None);
    }

    /// Subscribe to user changes; the current value is immediately available
    pub fn subscribe(&self) -> watch::Receiver<Option<UserRecord>> {
        self.user_tx.subscribe()
    }

    /// Last published user (in-memory copy)
    pub fn current_user(&self) -> Option<UserRecord> {
        self.user_tx.borrow().clone()
    }

    /// Name of the active backend
    pub fn backend(&self) -> String {
        self.storage
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .describe()
    }

    fn write_user(&self, user: &UserRecord) {
        match serde_json::to_string(user) {
            Ok(json) => {
                self.with_storage(|s| s.set(USER_KEY, &json));
            }
            Err(e) => tracing::error!("Failed to serialize user record: {}", e),
        }
    }

    fn write_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a storage operation, degrading to memory storage on the first failure
    fn with_storage<T>(&self, op: impl Fn(&dyn Storage) -> anyhow::Result<T>) -> Option<T> {
        {
            let storage = self.storage.read().unwrap_or_else(PoisonError::into_inner);
            match op(storage.as_ref()) {
                Ok(value) => return Some(value),
                Err(e) => tracing::warn!(
                    backend = %storage.describe(),
                    "Session storage failed, switching to in-memory storage: {:#}",
                    e
                ),
            }
        }

        let mut storage = self.storage.write().unwrap_or_else(PoisonError::into_inner);
        if storage.describe() != "memory" {
            *storage = Box::new(MemoryStorage::new());
            // The fresh backend holds no token, so no user may be published either
            if self.user_tx.send_replace(None).is_some() {
                tracing::warn!("Stored session was lost with the failed storage");
            }
        }
        op(storage.as_ref()).ok()
    }
}
