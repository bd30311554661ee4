//! Local pre-key bookkeeping.
//!
//! A [`PreKeyStore`] owns the private halves of one device's signed and
//! one-time pre-keys. It is shared between concurrent handshakes, so every
//! operation goes through one internal lock and one-time pre-key consumption
//! is atomic: however many callers race on the same id, at most one of them
//! gets the key.

mod bundle;
pub use bundle::*;

mod directory;
pub use directory::*;

use crate::keys::{
    EntropySource, IdentityKey, IdentityPublicKey, OneTimePreKey, SignedPreKey,
    generate_one_time_pre_keys,
};
use crate::{AccountConfig, Error, X25519PublicKey};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

pub(crate) struct PreKeyInner {
    pub(crate) signed: BTreeMap<u32, SignedPreKey>,
    /// Retirement time of every signed pre-key that is no longer current.
    pub(crate) retired: BTreeMap<u32, SystemTime>,
    pub(crate) current_signed_id: u32,
    pub(crate) next_signed_id: u32,
    pub(crate) one_time: BTreeMap<u32, OneTimePreKey>,
    pub(crate) next_one_time_id: u32,
}

/// Thread-safe store of a device's private pre-keys.
pub struct PreKeyStore {
    inner: Mutex<PreKeyInner>,
    rotation_interval: Duration,
    retention: Duration,
    min_one_time: usize,
    max_one_time: usize,
}

impl PreKeyStore {
    /// Creates a store with one signed pre-key and a full one-time pool.
    pub fn new(
        identity: &IdentityKey,
        config: &AccountConfig,
        entropy: &dyn EntropySource,
    ) -> Result<Self, Error> {
        let signed_pre_key = SignedPreKey::generate(identity, 1, SystemTime::now(), entropy)?;

        let mut one_time = BTreeMap::new();
        for key in generate_one_time_pre_keys(1, config.max_one_time_pre_keys, entropy)? {
            one_time.insert(key.id(), key);
        }

        let inner = PreKeyInner {
            signed: BTreeMap::from([(1, signed_pre_key)]),
            retired: BTreeMap::new(),
            current_signed_id: 1,
            next_signed_id: 2,
            next_one_time_id: u32::try_from(one_time.len())
                .map_err(|_| Error::PreKey("Pool size out of range".to_string()))?
                .wrapping_add(1),
            one_time,
        };

        Ok(Self::from_inner(inner, config))
    }

    pub(crate) fn from_inner(inner: PreKeyInner, config: &AccountConfig) -> Self {
        Self {
            inner: Mutex::new(inner),
            rotation_interval: config.signed_pre_key_rotation_interval,
            retention: config.signed_pre_key_retention,
            min_one_time: config.min_one_time_pre_keys,
            max_one_time: config.max_one_time_pre_keys,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PreKeyInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&PreKeyInner) -> R) -> R {
        f(&self.lock())
    }

    /// Returns the signed pre-key with `id` if it is current or still retained.
    pub fn signed_pre_key(&self, id: u32) -> Option<SignedPreKey> {
        self.lock().signed.get(&id).cloned()
    }

    /// Returns the signed pre-key new bundles advertise.
    pub fn current_signed_pre_key(&self) -> Result<SignedPreKey, Error> {
        let inner = self.lock();
        inner
            .signed
            .get(&inner.current_signed_id)
            .cloned()
            .ok_or_else(|| Error::PreKey("Current signed pre-key missing".to_string()))
    }

    /// Looks at an unused one-time pre-key without consuming it.
    pub fn one_time_pre_key(&self, id: u32) -> Option<OneTimePreKey> {
        self.lock().one_time.get(&id).cloned()
    }

    /// Atomically removes and returns the one-time pre-key with `id`.
    ///
    /// Of any number of concurrent callers for the same id, at most one gets `Some`.
    pub fn consume_one_time(&self, id: u32) -> Option<OneTimePreKey> {
        let key = self.lock().one_time.remove(&id);
        if key.is_some() {
            tracing::debug!(id, "consumed one-time pre-key");
        }
        key
    }

    /// Puts back a key returned by [`PreKeyStore::consume_one_time`] whose
    /// handshake could not be committed.
    pub fn restore_one_time(&self, key: OneTimePreKey) {
        self.lock().one_time.entry(key.id()).or_insert(key);
    }

    /// Lowest-id unused one-time pre-key.
    pub fn next_one_time_public(&self) -> Result<(u32, X25519PublicKey), Error> {
        self.lock()
            .one_time
            .values()
            .next()
            .map(|key| (key.id(), key.public_key()))
            .ok_or(Error::OneTimePreKeyExhausted)
    }

    /// Number of unused one-time pre-keys.
    pub fn one_time_count(&self) -> usize {
        self.lock().one_time.len()
    }

    /// Adds one-time pre-keys to the pool and returns the public halves that
    /// were accepted. Ids already in the pool are skipped.
    pub fn publish(&self, keys: Vec<OneTimePreKey>) -> Vec<(u32, X25519PublicKey)> {
        let mut inner = self.lock();
        let mut accepted = Vec::with_capacity(keys.len());

        for key in keys {
            let id = key.id();
            if inner.one_time.contains_key(&id) {
                tracing::warn!(id, "skipping duplicate one-time pre-key");
                continue;
            }
            accepted.push((id, key.public_key()));
            inner.next_one_time_id = inner.next_one_time_id.max(id.wrapping_add(1));
            inner.one_time.insert(id, key);
        }

        accepted
    }

    /// Tops the pool up to the configured maximum once it drops below the minimum.
    ///
    /// Returns the public halves of the new keys, empty when no top-up was needed.
    pub fn replenish(
        &self,
        entropy: &dyn EntropySource,
    ) -> Result<Vec<(u32, X25519PublicKey)>, Error> {
        let (first_id, missing) = {
            let inner = self.lock();
            if inner.one_time.len() >= self.min_one_time {
                return Ok(Vec::new());
            }
            (
                inner.next_one_time_id,
                self.max_one_time.saturating_sub(inner.one_time.len()),
            )
        };

        let keys = generate_one_time_pre_keys(first_id, missing, entropy)?;
        let published = self.publish(keys);
        tracing::debug!(count = published.len(), "replenished one-time pre-keys");

        Ok(published)
    }

    /// Replaces the current signed pre-key. The previous one is retained for
    /// in-flight handshakes until [`PreKeyStore::purge_retired`] drops it.
    pub fn rotate_signed_pre_key(
        &self,
        identity: &IdentityKey,
        now: SystemTime,
        entropy: &dyn EntropySource,
    ) -> Result<SignedPreKey, Error> {
        let mut inner = self.lock();

        let id = inner.next_signed_id;
        let signed_pre_key = SignedPreKey::generate(identity, id, now, entropy)?;

        let previous = inner.current_signed_id;
        inner.retired.insert(previous, now);
        inner.signed.insert(id, signed_pre_key.clone());
        inner.current_signed_id = id;
        inner.next_signed_id = id.wrapping_add(1);

        tracing::debug!(previous, current = id, "rotated signed pre-key");

        Ok(signed_pre_key)
    }

    /// Rotates when the current signed pre-key is older than the rotation
    /// interval, then purges expired retired keys.
    pub fn rotate_signed_pre_key_if_due(
        &self,
        identity: &IdentityKey,
        now: SystemTime,
        entropy: &dyn EntropySource,
    ) -> Result<Option<SignedPreKey>, Error> {
        let current = self.current_signed_pre_key()?;
        let age = now.duration_since(current.created_at()).unwrap_or_default();

        let rotated = if age >= self.rotation_interval {
            Some(self.rotate_signed_pre_key(identity, now, entropy)?)
        } else {
            None
        };

        self.purge_retired(now);
        Ok(rotated)
    }

    /// Drops retired signed pre-keys whose retention window has passed.
    /// Returns the purged ids.
    pub fn purge_retired(&self, now: SystemTime) -> Vec<u32> {
        let mut inner = self.lock();

        let expired: Vec<u32> = inner
            .retired
            .iter()
            .filter(|(_, retired_at)| {
                now.duration_since(**retired_at).unwrap_or_default() >= self.retention
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            inner.retired.remove(id);
            inner.signed.remove(id);
        }

        if !expired.is_empty() {
            tracing::debug!(?expired, "purged retired signed pre-keys");
        }

        expired
    }

    /// A bundle advertising the current signed pre-key and, when the pool is
    /// not empty, the lowest-id unused one-time pre-key.
    pub fn current_bundle(
        &self,
        identity: &IdentityPublicKey,
        registration_id: u32,
        device_id: u32,
    ) -> Result<PreKeyBundle, Error> {
        let one_time_pre_key = match self.next_one_time_public() {
            Ok(key) => Some(key),
            Err(err) => {
                tracing::debug!(%err, "publishing bundle without one-time pre-key");
                None
            }
        };

        Ok(self
            .published(identity, registration_id, device_id)?
            .bundle(one_time_pre_key))
    }

    /// Every public pre-key, for upload to a directory.
    pub fn published(
        &self,
        identity: &IdentityPublicKey,
        registration_id: u32,
        device_id: u32,
    ) -> Result<PublishedPreKeys, Error> {
        let signed_pre_key = self.current_signed_pre_key()?;
        let one_time_pre_keys = self
            .lock()
            .one_time
            .values()
            .map(|key| (key.id(), key.public_key()))
            .collect();

        Ok(PublishedPreKeys {
            registration_id,
            device_id,
            identity: *identity,
            signed_pre_key_id: signed_pre_key.id(),
            signed_pre_key: signed_pre_key.public_key(),
            signed_pre_key_signature: signed_pre_key.signature(),
            one_time_pre_keys,
        })
    }
}
