use crate::prekey::{PreKeyBundle, PublishedPreKeys};
use crate::Error;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Where devices upload their public pre-keys and initiators fetch bundles.
///
/// A directory hands out each one-time pre-key at most once and omits it from
/// bundles once the device's pool is drained.
#[async_trait]
pub trait PreKeyDirectory: Send + Sync {
    /// Upload or refresh the keys of `user_id`'s device `keys.device_id`.
    async fn publish(&self, user_id: &str, keys: PublishedPreKeys) -> Result<(), Error>;

    /// Fetch a bundle for one device of `user_id`.
    async fn fetch(&self, user_id: &str, device_id: u32) -> Result<PreKeyBundle, Error>;
}

#[derive(Default)]
struct DirectoryEntry {
    keys: Option<PublishedPreKeys>,
    handed_out: HashSet<u32>,
}

/// In-memory directory for testing and single-process deployments.
///
/// Cloning shares the underlying entries.
#[derive(Clone, Default)]
pub struct MemoryPreKeyDirectory {
    entries: Arc<Mutex<HashMap<(String, u32), DirectoryEntry>>>,
}

impl MemoryPreKeyDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, u32), DirectoryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of one-time pre-keys still available for a device.
    pub fn one_time_available(&self, user_id: &str, device_id: u32) -> usize {
        self.lock()
            .get(&(user_id.to_string(), device_id))
            .and_then(|entry| entry.keys.as_ref())
            .map_or(0, |keys| keys.one_time_pre_keys.len())
    }
}

#[async_trait]
impl PreKeyDirectory for MemoryPreKeyDirectory {
    async fn publish(&self, user_id: &str, mut keys: PublishedPreKeys) -> Result<(), Error> {
        keys.verify_signature()?;

        let mut entries = self.lock();
        let entry = entries
            .entry((user_id.to_string(), keys.device_id))
            .or_default();

        // Keys already handed to an initiator are never offered again.
        keys.one_time_pre_keys
            .retain(|(id, _)| !entry.handed_out.contains(id));

        tracing::debug!(
            user_id,
            device_id = keys.device_id,
            one_time = keys.one_time_pre_keys.len(),
            "published pre-keys"
        );
        entry.keys = Some(keys);

        Ok(())
    }

    async fn fetch(&self, user_id: &str, device_id: u32) -> Result<PreKeyBundle, Error> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(&(user_id.to_string(), device_id))
            .ok_or_else(|| Error::BundleUnavailable(format!("{user_id}/{device_id}")))?;
        let keys = entry
            .keys
            .as_mut()
            .ok_or_else(|| Error::BundleUnavailable(format!("{user_id}/{device_id}")))?;

        let one_time_pre_key = if keys.one_time_pre_keys.is_empty() {
            None
        } else {
            Some(keys.one_time_pre_keys.remove(0))
        };
        let bundle = keys.bundle(one_time_pre_key);

        if let Some((id, _)) = one_time_pre_key {
            entry.handed_out.insert(id);
        }

        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{IdentityKey, OsEntropy};
    use crate::prekey::PreKeyStore;
    use crate::AccountConfig;

    fn published(max_one_time_pre_keys: usize) -> PublishedPreKeys {
        let config = AccountConfig {
            max_one_time_pre_keys,
            ..AccountConfig::default()
        };
        let identity = IdentityKey::generate(&OsEntropy).unwrap();
        let store = PreKeyStore::new(&identity, &config, &OsEntropy).unwrap();
        store.published(&identity.public_key(), 42, 1).unwrap()
    }

    #[tokio::test]
    async fn test_each_one_time_key_handed_out_once() {
        let directory = MemoryPreKeyDirectory::new();
        let keys = published(2);
        directory.publish("bob", keys.clone()).await.unwrap();

        let first = directory.fetch("bob", 1).await.unwrap();
        let second = directory.fetch("bob", 1).await.unwrap();
        let third = directory.fetch("bob", 1).await.unwrap();

        assert_eq!(first.one_time_pre_key.map(|(id, _)| id), Some(1));
        assert_eq!(second.one_time_pre_key.map(|(id, _)| id), Some(2));
        assert!(third.one_time_pre_key.is_none());
        assert!(third.verify().is_ok());

        // Republishing the same pool does not resurrect handed-out keys.
        directory.publish("bob", keys).await.unwrap();
        assert_eq!(directory.one_time_available("bob", 1), 0);
    }

    #[tokio::test]
    async fn test_missing_bundle() {
        let directory = MemoryPreKeyDirectory::new();

        assert!(matches!(
            directory.fetch("nobody", 1).await,
            Err(Error::BundleUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_rejects_bad_signature() {
        let directory = MemoryPreKeyDirectory::new();
        let mut keys = published(1);
        keys.signed_pre_key_id += 1;

        assert!(matches!(
            directory.publish("bob", keys).await,
            Err(Error::UntrustedPreKey(_))
        ));
    }
}
