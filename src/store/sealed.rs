use crate::Error;
use crate::keys::{EntropySource, generate_random_seed};
use crate::store::StorageError;
use aes_gcm_siv::aead::{Aead, Payload};
use aes_gcm_siv::{Aes256GcmSiv, KeyInit, Nonce};
use zeroize::{Zeroize, ZeroizeOnDrop};

const SEAL_VERSION: u8 = 1;
const NONCE_SIZE: usize = 12;

/// Key that seals every record before it reaches a [`SessionStore`](crate::SessionStore).
///
/// Typically held in the platform keystore and handed to
/// [`Account::create`](crate::Account::create) and [`Account::open`](crate::Account::open).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StorageKey(Box<[u8; 32]>);

impl StorageKey {
    /// Generate a fresh random key.
    pub fn generate(entropy: &dyn EntropySource) -> Result<Self, Error> {
        Ok(Self(generate_random_seed(entropy)?))
    }

    /// Wrap existing key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Box::new(bytes))
    }

    fn cipher(&self) -> Result<Aes256GcmSiv, Error> {
        Aes256GcmSiv::new_from_slice(self.0.as_slice())
            .map_err(|_| Error::Crypto("Invalid storage key length".to_string()))
    }
}

/// `version || nonce || AES-256-GCM-SIV(plaintext, aad = slot)`
pub(crate) fn seal(
    key: &StorageKey,
    slot: &str,
    plaintext: &[u8],
    entropy: &dyn EntropySource,
) -> Result<Vec<u8>, Error> {
    let mut nonce = [0u8; NONCE_SIZE];
    entropy.try_fill(&mut nonce)?;

    let ciphertext = key.cipher()?.encrypt(
        Nonce::from_slice(&nonce),
        Payload {
            msg: plaintext,
            aad: slot.as_bytes(),
        },
    )?;

    let mut out = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
    out.push(SEAL_VERSION);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub(crate) fn open(key: &StorageKey, slot: &str, sealed: &[u8]) -> Result<Vec<u8>, Error> {
    let Some((&version, rest)) = sealed.split_first() else {
        return Err(StorageError::Sealed(format!("{slot}: empty record")).into());
    };
    if version != SEAL_VERSION {
        return Err(StorageError::Sealed(format!("{slot}: unknown version {version}")).into());
    }
    if rest.len() < NONCE_SIZE {
        return Err(StorageError::Sealed(format!("{slot}: truncated record")).into());
    }

    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
    key.cipher()?
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: slot.as_bytes(),
            },
        )
        .map_err(|_| StorageError::Sealed(format!("{slot}: authentication failed")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::OsEntropy;

    #[test]
    fn test_seal_and_open() {
        let key = StorageKey::generate(&OsEntropy).unwrap();
        let sealed = seal(&key, "slot", b"secret state", &OsEntropy).unwrap();

        assert!(!sealed.windows(12).any(|w| w == b"secret state"));
        assert_eq!(open(&key, "slot", &sealed).unwrap(), b"secret state");
    }

    #[test]
    fn test_blob_is_bound_to_slot() {
        let key = StorageKey::generate(&OsEntropy).unwrap();
        let sealed = seal(&key, "session/a", b"state", &OsEntropy).unwrap();

        assert!(matches!(
            open(&key, "session/b", &sealed),
            Err(Error::Storage(StorageError::Sealed(_)))
        ));
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let key = StorageKey::generate(&OsEntropy).unwrap();
        let other = StorageKey::from_bytes([1u8; 32]);
        let sealed = seal(&key, "slot", b"state", &OsEntropy).unwrap();

        assert!(open(&other, "slot", &sealed).is_err());
        assert!(open(&key, "slot", &[]).is_err());
        assert!(open(&key, "slot", &sealed[..5]).is_err());
    }
}
