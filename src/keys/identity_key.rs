use crate::keys::{EntropySource, generate_random_seed};
use crate::{Error, X25519PublicKey, X25519Secret};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::SharedSecret;
use zeroize::Zeroize;

const SIGNING_INFO: &[u8] = b"Vault-E2EE-Identity-Signing";
const AGREEMENT_INFO: &[u8] = b"Vault-E2EE-Identity-Agreement";

/// An account's long-term secret: an Ed25519 key that signs pre-keys and an
/// X25519 key used in handshakes.
///
/// Both are expanded from one random seed under distinct HKDF labels, so
/// neither secret is the other's scalar.
#[derive(Clone)]
pub struct IdentityKey {
    signing_key: Box<SigningKey>,
    dh_key: X25519Secret,
}

impl IdentityKey {
    pub(crate) fn generate(entropy: &dyn EntropySource) -> Result<Self, Error> {
        let mut seed = generate_random_seed(entropy)?;
        let hkdf = Hkdf::<Sha256>::new(None, seed.as_slice());
        seed.zeroize();

        let mut signing = Box::new([0u8; 32]);
        hkdf.expand(SIGNING_INFO, signing.as_mut_slice())
            .map_err(|_| Error::Crypto("HKDF expansion failed".to_string()))?;
        let signing_key = Box::new(SigningKey::from_bytes(&signing));
        signing.zeroize();

        let mut agreement = Box::new([0u8; 32]);
        hkdf.expand(AGREEMENT_INFO, agreement.as_mut_slice())
            .map_err(|_| Error::Crypto("HKDF expansion failed".to_string()))?;
        let dh_key = X25519Secret::from(agreement);

        Ok(Self {
            signing_key,
            dh_key,
        })
    }

    /// Ed25519 signature over `message`.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Returns the public halves of both keys.
    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            dh_key: self.dh_key.public_key(),
            signing_key: self.signing_key.verifying_key(),
        }
    }

    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> SharedSecret {
        self.dh_key.dh(public_key)
    }

    /// `ed25519 secret || x25519 secret`, for the sealed account record.
    pub(crate) fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        let (signing, agreement) = out.split_at_mut(32);
        signing.copy_from_slice(self.signing_key.as_bytes());
        agreement.copy_from_slice(self.dh_key.as_bytes());
        out
    }
}

impl From<[u8; 64]> for IdentityKey {
    fn from(mut bytes: [u8; 64]) -> Self {
        let mut signing = Box::new([0u8; 32]);
        let mut agreement = Box::new([0u8; 32]);
        signing.copy_from_slice(&bytes[..32]);
        agreement.copy_from_slice(&bytes[32..]);
        bytes.zeroize();

        let signing_key = Box::new(SigningKey::from_bytes(&signing));
        signing.zeroize();
        let dh_key = X25519Secret::from(agreement);

        Self {
            signing_key,
            dh_key,
        }
    }
}

/// The public identity of an account: an X25519 agreement key and an Ed25519
/// verification key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityPublicKey {
    dh_key: X25519PublicKey,
    signing_key: VerifyingKey,
}

impl IdentityPublicKey {
    /// X25519 key used in handshake agreement.
    pub fn dh_key(&self) -> X25519PublicKey {
        self.dh_key
    }

    /// Ed25519 key that signs pre-keys.
    pub fn signing_key(&self) -> VerifyingKey {
        self.signing_key
    }

    /// `dh_key || signing_key`
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[0..32].copy_from_slice(self.dh_key.as_bytes());
        bytes[32..64].copy_from_slice(self.signing_key.as_bytes());
        bytes
    }

    /// Parses the layout produced by [`IdentityPublicKey::to_bytes`].
    pub fn from_bytes(bytes: &[u8; 64]) -> Result<Self, Error> {
        let mut dh = [0u8; 32];
        dh.copy_from_slice(&bytes[0..32]);
        let mut signing = [0u8; 32];
        signing.copy_from_slice(&bytes[32..64]);

        let signing_key =
            VerifyingKey::from_bytes(&signing).map_err(|err| Error::Serde(err.to_string()))?;

        Ok(Self {
            dh_key: X25519PublicKey::from(dh),
            signing_key,
        })
    }
}

/// One per account: the identity key pair and the account it belongs to.
#[derive(Clone)]
pub struct Identity {
    account_id: String,
    key: IdentityKey,
}

impl Identity {
    pub(crate) fn new(account_id: &str, key: IdentityKey) -> Self {
        Self {
            account_id: account_id.to_string(),
            key,
        }
    }

    /// The owning account.
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// The private key pair.
    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    /// Shorthand for `self.key().public_key()`.
    pub fn public_key(&self) -> IdentityPublicKey {
        self.key.public_key()
    }
}
