//! Asynchronous handshake key agreement (X3DH).
//!
//! Both halves concatenate `DH1 || DH2 || DH3 [|| DH4]` and run it through
//! HKDF-SHA256:
//!
//! ```text
//! DH1 = DH(IK_initiator, SPK_responder)
//! DH2 = DH(EK_initiator, IK_responder)
//! DH3 = DH(EK_initiator, SPK_responder)
//! DH4 = DH(EK_initiator, OPK_responder)   // only when a one-time pre-key was used
//! ```

use crate::keys::{EntropySource, IdentityKey, OneTimePreKey, SignedPreKey};
use crate::prekey::PreKeyBundle;
use crate::{Error, X25519PublicKey, X25519Secret};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

const SALT: &[u8] = b"Vault-E2EE-X3DH";

/// Output of the handshake agreement; seeds the root key of the ratchet.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct X3DHSharedSecret(pub(crate) Box<[u8; 32]>);

/// The result of an X3DH key agreement started by the initiator.
///
/// Contains both the calculated shared secret and the ephemeral public key
/// that needs to be transmitted to the responder.
pub struct X3DHInitiation {
    shared_secret: X3DHSharedSecret,
    ephemeral_public: X25519PublicKey,
}

impl X3DHInitiation {
    /// Base key the responder needs to repeat the agreement.
    pub fn public_key(&self) -> X25519PublicKey {
        self.ephemeral_public
    }

    /// Drops the base key and keeps the secret.
    pub fn shared_secret(self) -> X3DHSharedSecret {
        self.shared_secret
    }
}

/// X3DH key agreement bound to an application info string.
pub struct X3DH {
    info: Vec<u8>,
}

impl X3DH {
    /// Handshake agreement bound to `info`, usually `AccountConfig::protocol_info`.
    ///
    /// Keys derived under different info strings are unrelated even when the
    /// same key material is used.
    pub fn new(info: &[u8]) -> Self {
        Self {
            info: info.to_vec(),
        }
    }

    /// Initiator side. Verifies the bundle before any secret is derived, so a
    /// forged bundle fails with [`Error::UntrustedPreKey`] and nothing else happens.
    pub fn initiate(
        &self,
        identity: &IdentityKey,
        bundle: &PreKeyBundle,
        entropy: &dyn EntropySource,
    ) -> Result<X3DHInitiation, Error> {
        bundle.verify()?;

        let ephemeral = X25519Secret::generate(entropy)?;

        let dh1 = identity.dh(&bundle.signed_pre_key);
        let dh2 = ephemeral.dh(&bundle.identity.dh_key());
        let dh3 = ephemeral.dh(&bundle.signed_pre_key);
        let dh4 = bundle
            .one_time_pre_key
            .map(|(_, one_time)| ephemeral.dh(&one_time));

        let shared_secret = self.calculate_shared_secret(dh1, dh2, dh3, dh4)?;

        Ok(X3DHInitiation {
            shared_secret,
            ephemeral_public: ephemeral.public_key(),
        })
    }

    /// Responder side: the same four agreements from the other end.
    pub fn respond(
        &self,
        identity: &IdentityKey,
        signed_pre_key: &SignedPreKey,
        one_time_pre_key: Option<&OneTimePreKey>,
        initiator_identity: &X25519PublicKey,
        initiator_ephemeral: &X25519PublicKey,
    ) -> Result<X3DHSharedSecret, Error> {
        let dh1 = signed_pre_key.dh(initiator_identity);
        let dh2 = identity.dh(initiator_ephemeral);
        let dh3 = signed_pre_key.dh(initiator_ephemeral);
        let dh4 = one_time_pre_key.map(|key| key.dh(initiator_ephemeral));

        self.calculate_shared_secret(dh1, dh2, dh3, dh4)
    }

    fn calculate_shared_secret(
        &self,
        dh1: SharedSecret,
        dh2: SharedSecret,
        dh3: SharedSecret,
        dh4: Option<SharedSecret>,
    ) -> Result<X3DHSharedSecret, Error> {
        let mut key_material = Vec::with_capacity(128);
        key_material.extend_from_slice(dh1.as_bytes());
        key_material.extend_from_slice(dh2.as_bytes());
        key_material.extend_from_slice(dh3.as_bytes());
        if let Some(dh4) = &dh4 {
            key_material.extend_from_slice(dh4.as_bytes());
        }

        let hkdf = Hkdf::<Sha256>::new(Some(SALT), &key_material);
        key_material.zeroize();

        let mut shared_secret = Box::new([0u8; 32]);
        hkdf.expand(&self.info, shared_secret.as_mut_slice())
            .map_err(|_| Error::Crypto("HKDF expansion failed".to_string()))?;

        Ok(X3DHSharedSecret(shared_secret))
    }
}
