//! Long-term and medium-term key material.
//!
//! Every secret in the crate is drawn through an [`EntropySource`]. The default
//! [`OsEntropy`] reads the platform CSPRNG and reports
//! [`Error::EntropyUnavailable`] instead of falling back to weaker randomness.

mod fingerprint;
pub use fingerprint::Fingerprint;

mod identity_key;
pub use identity_key::*;

mod one_time_pre_key;
pub use one_time_pre_key::OneTimePreKey;

mod pre_key;
pub use pre_key::*;

use crate::Error;
use rand::TryRngCore;
use rand::rngs::OsRng;
use std::time::SystemTime;

/// A source of cryptographically secure random bytes.
pub trait EntropySource: Send + Sync {
    /// Fill `dest` entirely or fail with [`Error::EntropyUnavailable`].
    fn try_fill(&self, dest: &mut [u8]) -> Result<(), Error>;
}

/// The operating system CSPRNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn try_fill(&self, dest: &mut [u8]) -> Result<(), Error> {
        OsRng
            .try_fill_bytes(dest)
            .map_err(|_| Error::EntropyUnavailable)
    }
}

/// Generates a cryptographically secure random 32-byte seed.
pub(crate) fn generate_random_seed(entropy: &dyn EntropySource) -> Result<Box<[u8; 32]>, Error> {
    let mut seed = Box::new([0u8; 32]);
    entropy.try_fill(seed.as_mut_slice())?;
    Ok(seed)
}

/// Generate the long-term identity for `account_id`.
pub fn generate_identity(account_id: &str, entropy: &dyn EntropySource) -> Result<Identity, Error> {
    Ok(Identity::new(account_id, IdentityKey::generate(entropy)?))
}

/// Generate a signed pre-key with the given id, signed by `identity`.
pub fn generate_signed_pre_key(
    identity: &IdentityKey,
    id: u32,
    entropy: &dyn EntropySource,
) -> Result<SignedPreKey, Error> {
    SignedPreKey::generate(identity, id, SystemTime::now(), entropy)
}

/// Generate `count` one-time pre-keys with consecutive ids starting at `first_id`.
pub fn generate_one_time_pre_keys(
    first_id: u32,
    count: usize,
    entropy: &dyn EntropySource,
) -> Result<Vec<OneTimePreKey>, Error> {
    let mut keys = Vec::with_capacity(count);
    let mut id = first_id;
    for _ in 0..count {
        keys.push(OneTimePreKey::generate(id, entropy)?);
        id = id.wrapping_add(1);
    }
    Ok(keys)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// An entropy source that always fails.
    pub(crate) struct FailingEntropy;

    impl EntropySource for FailingEntropy {
        fn try_fill(&self, _dest: &mut [u8]) -> Result<(), Error> {
            Err(Error::EntropyUnavailable)
        }
    }

    #[test]
    fn test_generation_fails_without_entropy() {
        assert_eq!(
            generate_identity("alice", &FailingEntropy).err(),
            Some(Error::EntropyUnavailable)
        );

        let identity = generate_identity("alice", &OsEntropy).unwrap();
        assert_eq!(
            generate_signed_pre_key(identity.key(), 1, &FailingEntropy).err(),
            Some(Error::EntropyUnavailable)
        );
        assert_eq!(
            generate_one_time_pre_keys(1, 3, &FailingEntropy).err(),
            Some(Error::EntropyUnavailable)
        );
    }

    #[test]
    fn test_one_time_pre_keys_are_distinct() {
        let keys = generate_one_time_pre_keys(10, 5, &OsEntropy).unwrap();

        let ids: Vec<u32> = keys.iter().map(OneTimePreKey::id).collect();
        assert_eq!(ids, vec![10, 11, 12, 13, 14]);

        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                assert_ne!(a.public_key(), b.public_key());
            }
        }
    }

    #[test]
    fn test_generated_signed_pre_key_verifies() {
        let identity = generate_identity("bob", &OsEntropy).unwrap();
        let spk = generate_signed_pre_key(identity.key(), 7, &OsEntropy).unwrap();

        assert!(
            verify_signed_pre_key(
                &identity.public_key(),
                spk.id(),
                &spk.public_key(),
                &spk.signature()
            )
            .is_ok()
        );
    }
}
