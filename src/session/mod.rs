use crate::envelope::{Envelope, PreKeyMessage, RatchetMessage, handshake_prefix};
use crate::keys::{EntropySource, IdentityPublicKey};
use crate::ratchet::AD_LEN;
use crate::{DoubleRatchet, Error, X25519PublicKey};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifies one session: a local user talking to one device of a remote user.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    local_user_id: String,
    remote_user_id: String,
    remote_device_id: u32,
}

impl SessionKey {
    /// Key for `local_user_id`'s session with `remote_user_id`'s device `remote_device_id`.
    pub fn new(local_user_id: &str, remote_user_id: &str, remote_device_id: u32) -> Self {
        Self {
            local_user_id: local_user_id.to_string(),
            remote_user_id: remote_user_id.to_string(),
            remote_device_id,
        }
    }

    /// The local user.
    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// The remote user.
    pub fn remote_user_id(&self) -> &str {
        &self.remote_user_id
    }

    /// The remote device.
    pub fn remote_device_id(&self) -> u32 {
        self.remote_device_id
    }

    /// Slot name under which the session is persisted. User ids are encoded so
    /// that no id can collide with another slot.
    pub fn storage_key(&self) -> String {
        format!(
            "session/{}/{}/{}",
            URL_SAFE_NO_PAD.encode(&self.local_user_id),
            URL_SAFE_NO_PAD.encode(&self.remote_user_id),
            self.remote_device_id
        )
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{}.{}",
            self.local_user_id, self.remote_user_id, self.remote_device_id
        )
    }
}

/// Lifecycle of a session as seen from the outside.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing exists for the peer device.
    NoSession,
    /// A handshake was computed but nothing has been sent yet. Lives only in memory.
    Pending,
    /// Messages have been exchanged; the session is persisted.
    Established,
}

/// Handshake parameters the initiator repeats in every message until the
/// responder answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// Responder's signed pre-key id.
    pub signed_pre_key_id: u32,
    /// Responder's one-time pre-key id, if one was used.
    pub one_time_pre_key_id: Option<u32>,
}

/// A secure messaging session between two devices.
///
/// Encapsulates a Double Ratchet instance along with the remote identity and
/// the handshake that created it.
#[derive(Clone)]
pub struct Session {
    pub(crate) session_id: String,
    pub(crate) ratchet: DoubleRatchet,
    pub(crate) remote_identity: IdentityPublicKey,
    pub(crate) remote_registration_id: u32,
    /// Initiator's handshake ephemeral key. Identifies the session across
    /// repeated pre-key messages.
    pub(crate) base_key: X25519PublicKey,
    /// Present on the initiator's side until the first reply arrives.
    pub(crate) handshake: Option<HandshakeInfo>,
}

impl Session {
    pub(crate) fn new(
        ratchet: DoubleRatchet,
        remote_identity: IdentityPublicKey,
        remote_registration_id: u32,
        base_key: X25519PublicKey,
        handshake: Option<HandshakeInfo>,
        initiator: &IdentityPublicKey,
        responder: &IdentityPublicKey,
    ) -> Self {
        Self {
            session_id: derive_session_id(initiator, responder, &base_key),
            ratchet,
            remote_identity,
            remote_registration_id,
            base_key,
            handshake,
        }
    }

    /// Stable identifier, equal on both sides.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Identity of the remote device's account.
    pub fn remote_identity(&self) -> IdentityPublicKey {
        self.remote_identity
    }

    /// Registration id the remote device announced.
    pub fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    /// Whether the responder has answered. Until then outgoing messages carry
    /// the handshake.
    pub fn is_acknowledged(&self) -> bool {
        self.handshake.is_none()
    }

    pub(crate) fn encrypt(
        &mut self,
        plaintext: &[u8],
        local_identity: &IdentityPublicKey,
        local_registration_id: u32,
    ) -> Result<Envelope, Error> {
        let context = match self.handshake {
            Some(handshake) => handshake_prefix(
                local_registration_id,
                local_identity,
                &self.base_key,
                handshake.signed_pre_key_id,
                handshake.one_time_pre_key_id,
            ),
            None => Vec::new(),
        };
        let message = self.ratchet.encrypt_with_context(plaintext, &context)?;

        Ok(match self.handshake {
            Some(handshake) => Envelope::PreKeyHandshake(PreKeyMessage {
                registration_id: local_registration_id,
                identity: *local_identity,
                base_key: self.base_key,
                signed_pre_key_id: handshake.signed_pre_key_id,
                one_time_pre_key_id: handshake.one_time_pre_key_id,
                message,
            }),
            None => Envelope::Ratchet(message),
        })
    }

    /// `context` is the handshake prefix for messages that arrived in a
    /// pre-key envelope and empty otherwise.
    pub(crate) fn decrypt(
        &mut self,
        message: &RatchetMessage,
        context: &[u8],
        entropy: &dyn EntropySource,
    ) -> Result<Vec<u8>, Error> {
        let plaintext = self.ratchet.decrypt_with_context(message, context, entropy)?;
        self.mark_as_established();
        Ok(plaintext)
    }

    /// Stops attaching the handshake to outgoing messages.
    fn mark_as_established(&mut self) {
        if self.handshake.take().is_some() {
            tracing::debug!(session_id = %self.session_id, "handshake acknowledged");
        }
    }
}

/// `initiator identity || responder identity`
pub(crate) fn associated_data(
    initiator: &IdentityPublicKey,
    responder: &IdentityPublicKey,
) -> Box<[u8; AD_LEN]> {
    let mut ad = Box::new([0u8; AD_LEN]);
    ad[0..64].copy_from_slice(&initiator.to_bytes());
    ad[64..128].copy_from_slice(&responder.to_bytes());
    ad
}

/// Derives a session ID from both identities and the handshake ephemeral key.
fn derive_session_id(
    initiator: &IdentityPublicKey,
    responder: &IdentityPublicKey,
    base_key: &X25519PublicKey,
) -> String {
    let mut hasher = Sha256::new();

    hasher.update(initiator.to_bytes());
    hasher.update(responder.to_bytes());
    hasher.update(base_key.as_bytes());

    STANDARD.encode(hasher.finalize())
}
