use crate::envelope::Envelope;
use crate::keys::IdentityPublicKey;
use crate::prekey::PreKeyBundle;
use crate::session::SessionState;
use crate::Error;
use async_trait::async_trait;

/// Per-device session management for one local account.
///
/// Sessions are addressed by remote user and device. Calls on the same session
/// are serialized by the implementation; calls on different sessions run
/// independently.
#[async_trait]
pub trait SessionEngine: Send + Sync {
    /// The local account id.
    fn local_user_id(&self) -> &str;

    /// The local device id.
    fn local_device_id(&self) -> u32;

    /// The local identity, as peers see it.
    fn identity_public_key(&self) -> IdentityPublicKey;

    /// Where the session with `remote_user_id`'s device stands.
    async fn session_state(
        &self,
        remote_user_id: &str,
        remote_device_id: u32,
    ) -> Result<SessionState, Error>;

    /// Runs the initiator half of the handshake against a fetched bundle.
    ///
    /// The resulting session is [`SessionState::Pending`] until the first
    /// [`SessionEngine::encrypt`] persists it.
    async fn initiate_session(&self, remote_user_id: &str, bundle: &PreKeyBundle)
    -> Result<(), Error>;

    /// Drops a pending handshake. Returns whether one existed.
    async fn abandon_handshake(&self, remote_user_id: &str, remote_device_id: u32) -> bool;

    /// Encrypts for one remote device.
    async fn encrypt(
        &self,
        remote_user_id: &str,
        remote_device_id: u32,
        plaintext: &[u8],
    ) -> Result<Envelope, Error>;

    /// Decrypts an envelope from one remote device, accepting the handshake
    /// if it opens a new session.
    async fn decrypt(
        &self,
        remote_user_id: &str,
        remote_device_id: u32,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, Error>;

    /// Forgets the session in memory and in storage.
    async fn delete_session(&self, remote_user_id: &str, remote_device_id: u32)
    -> Result<(), Error>;
}
