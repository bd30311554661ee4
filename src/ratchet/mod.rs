mod chain;
mod skipped;
mod state;

pub(crate) use crate::ratchet::chain::Chain;
pub(crate) use crate::ratchet::skipped::SkippedKeys;
pub(crate) use crate::ratchet::state::{AD_LEN, RatchetState};

use crate::envelope::RatchetMessage;
use crate::keys::EntropySource;
use crate::x3dh::X3DHSharedSecret;
use crate::{Error, X25519PublicKey, X25519Secret};
use aes_gcm_siv::aead::{Aead, Payload};
use aes_gcm_siv::{Aes256GcmSiv, KeyInit, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use std::cell::RefCell;
use x25519_dalek::SharedSecret;
use zeroize::Zeroize;

const NONCE_SIZE: usize = 12;
const ROOT_INFO: &[u8] = b"Vault-E2EE-Ratchet";
const MESSAGE_INFO: &[u8] = b"Vault-E2EE-Message-Keys";

thread_local! {
    static AD_BUFFER: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(256));
}

fn with_ad_buffer<F, R>(f: F) -> R
where
    F: FnOnce(&mut Vec<u8>) -> R,
{
    AD_BUFFER.with(|buffer| {
        let mut buffer = buffer.borrow_mut();
        buffer.clear();
        f(&mut buffer)
    })
}

/// Double Ratchet state for one session.
///
/// Every message key is used once and then dropped. A new remote ratchet key
/// triggers a DH step that re-keys the root and both chains. Keys for messages
/// that have not arrived yet wait in a bounded cache.
///
/// Decryption is transactional: a message that fails to authenticate leaves
/// the state exactly as it was.
#[derive(Clone)]
pub struct DoubleRatchet {
    pub(crate) state: RatchetState,
    pub(crate) skipped: SkippedKeys,
    pub(crate) max_skip: u32,
}

impl DoubleRatchet {
    /// Our current ratchet public key, sent in every header.
    pub fn public_key(&self) -> X25519PublicKey {
        self.state.dh_pair.public_key()
    }

    /// Number of message keys held for messages that have not arrived yet.
    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    /// Initializes a ratchet for the initiator.
    ///
    /// Called after the handshake, with the shared secret and the responder's
    /// signed pre-key, which serves as the responder's first ratchet key.
    pub fn initialize_for_alice(
        shared_secret: X3DHSharedSecret,
        bob_public_key: &X25519PublicKey,
        ad: Box<[u8; AD_LEN]>,
        max_skip: u32,
        max_skipped_message_keys: usize,
        entropy: &dyn EntropySource,
    ) -> Result<Self, Error> {
        let dh_pair = X25519Secret::generate(entropy)?;

        let dh_output = dh_pair.dh(bob_public_key);
        let (root_key, chain_key) = Self::kdf_rk(&shared_secret.0, dh_output)?;

        Ok(Self {
            state: RatchetState {
                dh_pair,
                remote_dh_key_public: Some(*bob_public_key),
                root_key,
                sending_chain: Some(Chain::new(chain_key)),
                receiving_chain: None,
                previous_sending_chain_length: 0,
                ad,
            },
            skipped: SkippedKeys::new(max_skipped_message_keys),
            max_skip,
        })
    }

    /// Initializes a ratchet for the responder.
    ///
    /// The signed pre-key pair is the first ratchet key; no sending chain exists
    /// until the initiator's first message arrives.
    pub fn initialize_for_bob(
        shared_secret: X3DHSharedSecret,
        dh_pair: X25519Secret,
        ad: Box<[u8; AD_LEN]>,
        max_skip: u32,
        max_skipped_message_keys: usize,
    ) -> Self {
        Self {
            state: RatchetState {
                dh_pair,
                remote_dh_key_public: None,
                root_key: shared_secret.0.clone(),
                sending_chain: None,
                receiving_chain: None,
                previous_sending_chain_length: 0,
                ad,
            },
            skipped: SkippedKeys::new(max_skipped_message_keys),
            max_skip,
        }
    }

    /// Key derivation function for the root key ratchet.
    ///
    /// Returns the new root key and the new chain key.
    fn kdf_rk(
        root_key: &[u8; 32],
        mut dh_output: SharedSecret,
    ) -> Result<(Box<[u8; 32]>, Box<[u8; 32]>), Error> {
        let hkdf = Hkdf::<Sha256>::new(Some(root_key), dh_output.as_bytes());
        dh_output.zeroize();

        let mut okm = [0u8; 64];
        hkdf.expand(ROOT_INFO, &mut okm)
            .map_err(|_| Error::Crypto("HKDF expansion failed for root key".to_string()))?;

        let mut new_root_key = Box::new([0u8; 32]);
        let mut chain_key = Box::new([0u8; 32]);
        new_root_key.copy_from_slice(&okm[0..32]);
        chain_key.copy_from_slice(&okm[32..64]);
        okm.zeroize();

        Ok((new_root_key, chain_key))
    }

    /// Encrypts a message and advances the sending chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage, Error> {
        self.encrypt_with_context(plaintext, &[])
    }

    /// Like [`DoubleRatchet::encrypt`], additionally authenticating `context`.
    /// The receiver must present the same bytes to decrypt.
    pub fn encrypt_with_context(
        &mut self,
        plaintext: &[u8],
        context: &[u8],
    ) -> Result<RatchetMessage, Error> {
        let mut sending_chain = self
            .state
            .sending_chain
            .clone()
            .ok_or_else(|| Error::NoSession("sending chain not established".to_string()))?;

        let counter = sending_chain.index;
        let mut message_key = sending_chain.next()?;

        let mut message = RatchetMessage {
            ratchet_key: self.public_key(),
            previous_chain_length: self.state.previous_sending_chain_length,
            counter,
            ciphertext: Vec::new(),
        };

        let header = message.header_bytes();
        let ciphertext = with_ad_buffer(|buffer| {
            buffer.extend_from_slice(self.state.ad.as_slice());
            buffer.extend_from_slice(context);
            buffer.extend_from_slice(&header);
            Self::encrypt_message(&message_key, plaintext, buffer)
        });
        message_key.zeroize();

        message.ciphertext = ciphertext?;
        self.state.sending_chain = Some(sending_chain);

        Ok(message)
    }

    /// Decrypts a message.
    ///
    /// All work happens on a copy of the state that replaces the current one
    /// only once the ciphertext has authenticated. Tampered, replayed and
    /// undecryptable messages fail with [`Error::AuthenticationFailed`].
    pub fn decrypt(
        &mut self,
        message: &RatchetMessage,
        entropy: &dyn EntropySource,
    ) -> Result<Vec<u8>, Error> {
        self.decrypt_with_context(message, &[], entropy)
    }

    /// Decrypts a message sent with [`DoubleRatchet::encrypt_with_context`].
    pub fn decrypt_with_context(
        &mut self,
        message: &RatchetMessage,
        context: &[u8],
        entropy: &dyn EntropySource,
    ) -> Result<Vec<u8>, Error> {
        let mut next = self.clone();
        let plaintext = next.decrypt_in_place(message, context, entropy)?;
        *self = next;
        Ok(plaintext)
    }

    fn decrypt_in_place(
        &mut self,
        message: &RatchetMessage,
        context: &[u8],
        entropy: &dyn EntropySource,
    ) -> Result<Vec<u8>, Error> {
        if let Some(message_key) = self.skipped.take(&message.ratchet_key, message.counter) {
            return self.open(message_key, message, context);
        }

        if self.state.remote_dh_key_public != Some(message.ratchet_key) {
            self.skip_message_keys(message.previous_chain_length)?;
            self.dh_ratchet(&message.ratchet_key, entropy)?;
        }

        self.skip_message_keys(message.counter)?;

        let receiving_chain = self
            .state
            .receiving_chain
            .as_mut()
            .ok_or(Error::AuthenticationFailed)?;

        // Behind the chain and not cached: already consumed or evicted.
        if receiving_chain.index != message.counter {
            return Err(Error::AuthenticationFailed);
        }

        let message_key = receiving_chain.next()?;
        self.open(message_key, message, context)
    }

    fn open(
        &self,
        mut message_key: Box<[u8; 32]>,
        message: &RatchetMessage,
        context: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let header = message.header_bytes();
        let plaintext = with_ad_buffer(|buffer| {
            buffer.extend_from_slice(self.state.ad.as_slice());
            buffer.extend_from_slice(context);
            buffer.extend_from_slice(&header);
            Self::decrypt_message(&message_key, &message.ciphertext, buffer)
        });
        message_key.zeroize();
        plaintext
    }

    /// Performs a Diffie-Hellman ratchet step towards a new remote ratchet key.
    fn dh_ratchet(
        &mut self,
        remote: &X25519PublicKey,
        entropy: &dyn EntropySource,
    ) -> Result<(), Error> {
        let previous_chain_length = self
            .state
            .sending_chain
            .as_ref()
            .map_or(0, |chain| chain.index);

        let (root_key, chain_key) =
            Self::kdf_rk(&self.state.root_key, self.state.dh_pair.dh(remote))?;
        self.state.root_key = root_key;
        self.state.receiving_chain = Some(Chain::new(chain_key));

        self.state.dh_pair = X25519Secret::generate(entropy)?;

        let (root_key, chain_key) =
            Self::kdf_rk(&self.state.root_key, self.state.dh_pair.dh(remote))?;
        self.state.root_key = root_key;
        self.state.sending_chain = Some(Chain::new(chain_key));

        self.state.previous_sending_chain_length = previous_chain_length;
        self.state.remote_dh_key_public = Some(*remote);

        tracing::debug!(previous_chain_length, "ratchet step");

        Ok(())
    }

    /// Derives and caches the keys of every message before `until` on the
    /// current receiving chain.
    fn skip_message_keys(&mut self, until: u32) -> Result<(), Error> {
        let Some(remote) = self.state.remote_dh_key_public else {
            return Ok(());
        };
        let Some(receiving_chain) = self.state.receiving_chain.as_mut() else {
            return Ok(());
        };

        if until <= receiving_chain.index {
            return Ok(());
        }

        if until - receiving_chain.index > self.max_skip {
            tracing::warn!(
                gap = until - receiving_chain.index,
                max_skip = self.max_skip,
                "rejecting message beyond skip limit"
            );
            return Err(Error::AuthenticationFailed);
        }

        while receiving_chain.index < until {
            let counter = receiving_chain.index;
            let message_key = receiving_chain.next()?;
            self.skipped.insert(&remote, counter, message_key);
        }

        Ok(())
    }

    /// Derive the AEAD key and nonce from a message key.
    fn message_cipher(key: &[u8; 32]) -> Result<(Aes256GcmSiv, [u8; NONCE_SIZE]), Error> {
        let hkdf = Hkdf::<Sha256>::new(None, key);

        let mut derived_material = [0u8; 44];
        hkdf.expand(MESSAGE_INFO, &mut derived_material)
            .map_err(|_| Error::Crypto("HKDF expansion failed".to_string()))?;

        let cipher = Aes256GcmSiv::new_from_slice(&derived_material[0..32])
            .map_err(|_| Error::Crypto("Invalid message key length".to_string()))?;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&derived_material[32..44]);
        derived_material.zeroize();

        Ok((cipher, nonce))
    }

    fn encrypt_message(key: &[u8; 32], plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>, Error> {
        let (cipher, nonce) = Self::message_cipher(key)?;

        cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: ad,
                },
            )
            .map_err(Error::from)
    }

    fn decrypt_message(key: &[u8; 32], ciphertext: &[u8], ad: &[u8]) -> Result<Vec<u8>, Error> {
        let (cipher, nonce) = Self::message_cipher(key)?;

        cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: ad,
                },
            )
            .map_err(|_| Error::AuthenticationFailed)
    }
}
