//! Persistence interface.
//!
//! The engine persists opaque, already-sealed blobs under string slot names.
//! Implementations only need durable `load`/`save`/`delete`; they never see key
//! material in the clear.

mod sealed;
pub use sealed::StorageKey;
pub(crate) use sealed::{open, seal};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Errors reported by a [`SessionStore`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The backend failed to read or write.
    #[error("I/O error: {0}")]
    Io(String),

    /// A stored blob failed to unseal: wrong key, wrong slot, or corruption.
    #[error("Sealed record rejected: {0}")]
    Sealed(String),
}

/// Durable key/value storage for sealed session and account records.
///
/// `save` must be atomic per key: after a crash, `load` returns either the
/// previous value or the new one, never a mix.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns the blob saved under `key`, if any.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replaces the blob under `key`.
    async fn save(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Removes `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory storage for testing and simulation.
///
/// Cloning shares the underlying map, so a clone handed to a restarted
/// [`Account`](crate::Account) sees everything the previous instance saved.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Slot names currently held, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Raw stored bytes for a slot.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).cloned()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn save(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.lock().remove(key);
        Ok(())
    }
}
