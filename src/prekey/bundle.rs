use crate::keys::{IdentityPublicKey, verify_signed_pre_key};
use crate::{Error, X25519PublicKey};
use ed25519_dalek::Signature;

/// Everything an initiator needs to open a session with one device.
///
/// Contains:
/// - Identity key for authentication and key agreement
/// - Signed pre-key with signature for authenticated key agreement
/// - Optional one-time pre-key for additional security
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreKeyBundle {
    /// Registration id of the publishing device.
    pub registration_id: u32,
    /// Device the bundle belongs to.
    pub device_id: u32,
    /// Long-term identity of the publishing account.
    pub identity: IdentityPublicKey,
    /// Id of the signed pre-key.
    pub signed_pre_key_id: u32,
    /// Public signed pre-key.
    pub signed_pre_key: X25519PublicKey,
    /// Signature over the signed pre-key.
    pub signed_pre_key_signature: Signature,
    /// One unused one-time pre-key, absent when the pool is exhausted.
    pub one_time_pre_key: Option<(u32, X25519PublicKey)>,
}

impl PreKeyBundle {
    /// Verifies the bundle's signature to ensure authenticity.
    ///
    /// This verification confirms that the signed pre-key was actually created
    /// by the owner of the identity key.
    pub fn verify(&self) -> Result<(), Error> {
        verify_signed_pre_key(
            &self.identity,
            self.signed_pre_key_id,
            &self.signed_pre_key,
            &self.signed_pre_key_signature,
        )
    }
}

/// The full set of public pre-keys a device uploads to a directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedPreKeys {
    /// Registration id of the publishing device.
    pub registration_id: u32,
    /// Device the keys belong to.
    pub device_id: u32,
    /// Long-term identity of the publishing account.
    pub identity: IdentityPublicKey,
    /// Id of the current signed pre-key.
    pub signed_pre_key_id: u32,
    /// Current public signed pre-key.
    pub signed_pre_key: X25519PublicKey,
    /// Signature over the signed pre-key.
    pub signed_pre_key_signature: Signature,
    /// Every unused one-time pre-key, ordered by id.
    pub one_time_pre_keys: Vec<(u32, X25519PublicKey)>,
}

impl PublishedPreKeys {
    /// Checks the signed pre-key signature before the keys are accepted.
    pub fn verify_signature(&self) -> Result<(), Error> {
        verify_signed_pre_key(
            &self.identity,
            self.signed_pre_key_id,
            &self.signed_pre_key,
            &self.signed_pre_key_signature,
        )
    }

    /// A bundle carrying the given one-time pre-key, if any.
    pub fn bundle(&self, one_time_pre_key: Option<(u32, X25519PublicKey)>) -> PreKeyBundle {
        PreKeyBundle {
            registration_id: self.registration_id,
            device_id: self.device_id,
            identity: self.identity,
            signed_pre_key_id: self.signed_pre_key_id,
            signed_pre_key: self.signed_pre_key,
            signed_pre_key_signature: self.signed_pre_key_signature,
            one_time_pre_key,
        }
    }
}
