use crate::keys::{EntropySource, IdentityKey, IdentityPublicKey};
use crate::{Error, X25519PublicKey, X25519Secret};
use ed25519_dalek::Signature;
use std::time::SystemTime;
use x25519_dalek::SharedSecret;

/// A medium-term signed pre-key.
///
/// The signature binds the public key and its id to the owner's identity, so a
/// directory cannot substitute its own key.
#[derive(Clone)]
pub struct SignedPreKey {
    id: u32,
    key_pair: X25519Secret,
    signature: Signature,
    created_at: SystemTime,
}

impl SignedPreKey {
    pub(crate) fn generate(
        identity: &IdentityKey,
        id: u32,
        created_at: SystemTime,
        entropy: &dyn EntropySource,
    ) -> Result<Self, Error> {
        let key_pair = X25519Secret::generate(entropy)?;
        let payload = signed_payload(&identity.public_key(), id, &key_pair.public_key());
        let signature = identity.sign(&payload);

        Ok(Self {
            id,
            key_pair,
            signature,
            created_at,
        })
    }

    pub(crate) fn from_parts(
        id: u32,
        key_pair: X25519Secret,
        signature: Signature,
        created_at: SystemTime,
    ) -> Self {
        Self {
            id,
            key_pair,
            signature,
            created_at,
        }
    }

    /// Returns the unique identifier for this signed pre-key.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the public component of this signed pre-key.
    pub fn public_key(&self) -> X25519PublicKey {
        self.key_pair.public_key()
    }

    /// Signature over the public key and id.
    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// When this key was generated.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub(crate) fn key_pair(&self) -> &X25519Secret {
        &self.key_pair
    }

    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> SharedSecret {
        self.key_pair.dh(public_key)
    }
}

/// `spk_public || id (BE) || identity_dh_public`
fn signed_payload(identity: &IdentityPublicKey, id: u32, public: &X25519PublicKey) -> [u8; 68] {
    let mut payload = [0u8; 68];
    payload[0..32].copy_from_slice(public.as_bytes());
    payload[32..36].copy_from_slice(&id.to_be_bytes());
    payload[36..68].copy_from_slice(identity.dh_key().as_bytes());
    payload
}

/// Checks that `signature` was produced by `identity` over the given pre-key.
///
/// Pure function: no state is touched whether or not it succeeds.
pub fn verify_signed_pre_key(
    identity: &IdentityPublicKey,
    id: u32,
    public: &X25519PublicKey,
    signature: &Signature,
) -> Result<(), Error> {
    let payload = signed_payload(identity, id, public);
    identity
        .signing_key()
        .verify_strict(&payload, signature)
        .map_err(|err| Error::UntrustedPreKey(err.to_string()))
}
