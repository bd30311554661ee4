use crate::X25519PublicKey;
use std::collections::{HashMap, VecDeque};
use zeroize::Zeroize;

type SkippedKeyId = ([u8; 32], u32);

/// Message keys derived ahead of time for messages that have not arrived yet.
///
/// Bounded: once `capacity` keys are held, inserting evicts the oldest.
#[derive(Clone)]
pub(crate) struct SkippedKeys {
    keys: HashMap<SkippedKeyId, Box<[u8; 32]>>,
    order: VecDeque<SkippedKeyId>,
    capacity: usize,
}

impl SkippedKeys {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            keys: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn insert(
        &mut self,
        ratchet_key: &X25519PublicKey,
        counter: u32,
        message_key: Box<[u8; 32]>,
    ) {
        if self.capacity == 0 {
            return;
        }

        while self.keys.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(mut evicted) = self.keys.remove(&oldest) {
                evicted.zeroize();
                tracing::debug!(counter = oldest.1, "evicted skipped message key");
            }
        }

        let id = (ratchet_key.to_bytes(), counter);
        if self.keys.insert(id, message_key).is_none() {
            self.order.push_back(id);
        }
    }

    /// Removes and returns the key, so it can be used at most once.
    pub(crate) fn take(
        &mut self,
        ratchet_key: &X25519PublicKey,
        counter: u32,
    ) -> Option<Box<[u8; 32]>> {
        let id = (ratchet_key.to_bytes(), counter);
        let key = self.keys.remove(&id)?;
        self.order.retain(|entry| *entry != id);
        Some(key)
    }

    /// Entries oldest first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (X25519PublicKey, u32, &[u8; 32])> + '_ {
        self.order.iter().filter_map(|id| {
            self.keys
                .get(id)
                .map(|key| (X25519PublicKey::from(id.0), id.1, key.as_ref()))
        })
    }
}

impl Drop for SkippedKeys {
    fn drop(&mut self) {
        for key in self.keys.values_mut() {
            key.zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> X25519PublicKey {
        X25519PublicKey::from([byte; 32])
    }

    #[test]
    fn test_take_is_single_use() {
        let mut skipped = SkippedKeys::new(10);
        skipped.insert(&key(1), 4, Box::new([4u8; 32]));

        assert_eq!(skipped.take(&key(1), 4).map(|k| *k), Some([4u8; 32]));
        assert!(skipped.take(&key(1), 4).is_none());
        assert_eq!(skipped.len(), 0);
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut skipped = SkippedKeys::new(3);
        for counter in 0..5 {
            skipped.insert(&key(1), counter, Box::new([0u8; 32]));
        }

        assert_eq!(skipped.len(), 3);
        assert!(skipped.take(&key(1), 0).is_none());
        assert!(skipped.take(&key(1), 1).is_none());
        assert!(skipped.take(&key(1), 2).is_some());

        let remaining: Vec<u32> = skipped.iter().map(|(_, counter, _)| counter).collect();
        assert_eq!(remaining, vec![3, 4]);
    }

    #[test]
    fn test_keys_are_scoped_by_ratchet_key() {
        let mut skipped = SkippedKeys::new(10);
        skipped.insert(&key(1), 0, Box::new([1u8; 32]));
        skipped.insert(&key(2), 0, Box::new([2u8; 32]));

        assert_eq!(skipped.take(&key(2), 0).map(|k| *k), Some([2u8; 32]));
        assert_eq!(skipped.take(&key(1), 0).map(|k| *k), Some([1u8; 32]));
    }
}
