use crate::keys::EntropySource;
use crate::{Error, X25519PublicKey, X25519Secret};
use x25519_dalek::SharedSecret;

/// A one-time pre-key.
///
/// Each key takes part in at most one successful handshake; the owning
/// [`PreKeyStore`](crate::PreKeyStore) enforces that by removing it on use.
#[derive(Clone)]
pub struct OneTimePreKey {
    id: u32,
    key_pair: X25519Secret,
}

impl OneTimePreKey {
    pub(crate) fn generate(id: u32, entropy: &dyn EntropySource) -> Result<Self, Error> {
        Ok(Self {
            id,
            key_pair: X25519Secret::generate(entropy)?,
        })
    }

    pub(crate) fn from_parts(id: u32, key_pair: X25519Secret) -> Self {
        Self { id, key_pair }
    }

    /// Returns the unique identifier for this pre-key.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the public component of this pre-key.
    pub fn public_key(&self) -> X25519PublicKey {
        self.key_pair.public_key()
    }

    pub(crate) fn key_pair(&self) -> &X25519Secret {
        &self.key_pair
    }

    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> SharedSecret {
        self.key_pair.dh(public_key)
    }
}
