mod trust;
pub use trust::TrustedIdentity;
pub(crate) use trust::IdentityTrustStore;

use crate::engine::SessionEngine;
use crate::envelope::{Envelope, PreKeyMessage, RatchetMessage};
use crate::keys::{
    EntropySource, Fingerprint, Identity, IdentityPublicKey, OneTimePreKey, OsEntropy,
    SignedPreKey, generate_identity,
};
use crate::prekey::{PreKeyBundle, PreKeyDirectory, PreKeyStore, PublishedPreKeys};
use crate::proto::{decode_account, encode_account};
use crate::session::{HandshakeInfo, Session, SessionKey, SessionState, associated_data};
use crate::store::{SessionStore, StorageKey, open, seal};
use crate::x3dh::X3DH;
use crate::{AccountConfig, DoubleRatchet, Error, X25519PublicKey};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tokio::sync::Mutex as AsyncMutex;

/// In-memory view of one session slot.
///
/// `pending` holds a handshake that has not been sent yet; it is promoted to
/// `established` by the first encrypt, which is also the first time it is
/// persisted.
#[derive(Default)]
struct SessionSlot {
    loaded: bool,
    established: Option<Session>,
    pending: Option<Session>,
}

/// A local account on one device: its keys, its trust decisions, and every
/// session it holds.
///
/// `Account` is the concrete [`SessionEngine`]. Create one instance per local
/// account and share it by reference; nothing in the crate is global.
///
/// Every change is sealed with the [`StorageKey`] and written through the
/// [`SessionStore`] before it becomes visible in memory, so a failed or
/// interrupted write leaves the previous persisted state in place.
pub struct Account<S: SessionStore> {
    identity: Identity,
    device_id: u32,
    registration_id: u32,
    pre_keys: PreKeyStore,
    trust: IdentityTrustStore,
    sessions: Mutex<HashMap<SessionKey, Arc<AsyncMutex<SessionSlot>>>>,
    session_index: Mutex<BTreeSet<String>>,
    account_write: AsyncMutex<()>,
    store: S,
    storage_key: StorageKey,
    entropy: Arc<dyn EntropySource>,
    config: AccountConfig,
}

fn account_slot(account_id: &str) -> String {
    format!("account/{}", URL_SAFE_NO_PAD.encode(account_id))
}

fn generate_registration_id(entropy: &dyn EntropySource) -> Result<u32, Error> {
    let mut bytes = [0u8; 4];
    entropy.try_fill(&mut bytes)?;
    Ok((u32::from_be_bytes(bytes) & 0x3fff).max(1))
}

impl<S: SessionStore> Account<S> {
    /// Creates a new account with fresh keys and persists it.
    pub async fn create(
        account_id: &str,
        device_id: u32,
        store: S,
        storage_key: StorageKey,
        config: AccountConfig,
    ) -> Result<Self, Error> {
        Self::create_with_entropy(
            account_id,
            device_id,
            store,
            storage_key,
            config,
            Arc::new(OsEntropy),
        )
        .await
    }

    /// Like [`Account::create`], drawing every secret from `entropy`.
    pub async fn create_with_entropy(
        account_id: &str,
        device_id: u32,
        store: S,
        storage_key: StorageKey,
        config: AccountConfig,
        entropy: Arc<dyn EntropySource>,
    ) -> Result<Self, Error> {
        let identity = generate_identity(account_id, entropy.as_ref())?;
        let registration_id = generate_registration_id(entropy.as_ref())?;
        let pre_keys = PreKeyStore::new(identity.key(), &config, entropy.as_ref())?;

        let account = Self {
            identity,
            device_id,
            registration_id,
            pre_keys,
            trust: IdentityTrustStore::default(),
            sessions: Mutex::new(HashMap::new()),
            session_index: Mutex::new(BTreeSet::new()),
            account_write: AsyncMutex::new(()),
            store,
            storage_key,
            entropy,
            config,
        };
        account.persist_account().await?;

        tracing::debug!(account_id, device_id, "created account");

        Ok(account)
    }

    /// Restores a persisted account. Returns `None` when nothing is stored
    /// under `account_id`.
    pub async fn open(
        account_id: &str,
        store: S,
        storage_key: StorageKey,
        config: AccountConfig,
    ) -> Result<Option<Self>, Error> {
        Self::open_with_entropy(account_id, store, storage_key, config, Arc::new(OsEntropy)).await
    }

    /// Like [`Account::open`], drawing every secret from `entropy`.
    pub async fn open_with_entropy(
        account_id: &str,
        store: S,
        storage_key: StorageKey,
        config: AccountConfig,
        entropy: Arc<dyn EntropySource>,
    ) -> Result<Option<Self>, Error> {
        let slot = account_slot(account_id);
        let Some(sealed) = store.load(&slot).await? else {
            return Ok(None);
        };

        let parts = decode_account(&open(&storage_key, &slot, &sealed)?)?;
        if parts.account_id != account_id {
            return Err(Error::Serde(format!(
                "Record belongs to {}, not {account_id}",
                parts.account_id
            )));
        }

        let account = Self {
            identity: Identity::new(account_id, parts.identity),
            device_id: parts.device_id,
            registration_id: parts.registration_id,
            pre_keys: PreKeyStore::from_inner(parts.pre_keys, &config),
            trust: IdentityTrustStore::from_entries(parts.trusted),
            sessions: Mutex::new(HashMap::new()),
            session_index: Mutex::new(parts.sessions.into_iter().collect()),
            account_write: AsyncMutex::new(()),
            store,
            storage_key,
            entropy,
            config,
        };

        tracing::debug!(account_id, device_id = account.device_id, "opened account");

        Ok(Some(account))
    }

    /// The account's long-term identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Registration id announced in outgoing handshakes.
    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    /// The configuration the account was created or opened with.
    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    /// Local pre-key bookkeeping.
    pub fn pre_keys(&self) -> &PreKeyStore {
        &self.pre_keys
    }

    /// A bundle for initiators, with one one-time pre-key if any is left.
    pub fn current_bundle(&self) -> Result<PreKeyBundle, Error> {
        self.pre_keys.current_bundle(
            &self.identity.public_key(),
            self.registration_id,
            self.device_id,
        )
    }

    /// Every public pre-key of this device.
    pub fn published_pre_keys(&self) -> Result<PublishedPreKeys, Error> {
        self.pre_keys.published(
            &self.identity.public_key(),
            self.registration_id,
            self.device_id,
        )
    }

    /// Uploads [`Account::published_pre_keys`] to `directory`.
    pub async fn publish_to<D: PreKeyDirectory + ?Sized>(&self, directory: &D) -> Result<(), Error> {
        let keys = self.published_pre_keys()?;
        directory.publish(self.identity.account_id(), keys).await
    }

    /// Tops up the one-time pre-key pool when it runs low. Returns the new
    /// public keys, which still have to be published.
    pub async fn replenish_one_time_pre_keys(
        &self,
    ) -> Result<Vec<(u32, X25519PublicKey)>, Error> {
        let fresh = self.pre_keys.replenish(self.entropy.as_ref())?;
        if !fresh.is_empty() {
            self.persist_account().await?;
        }
        Ok(fresh)
    }

    /// Rotates the signed pre-key when it is older than the configured
    /// interval and drops retired keys past retention.
    pub async fn rotate_signed_pre_key_if_due(
        &self,
        now: SystemTime,
    ) -> Result<Option<SignedPreKey>, Error> {
        let rotated = self.pre_keys.rotate_signed_pre_key_if_due(
            self.identity.key(),
            now,
            self.entropy.as_ref(),
        )?;
        self.persist_account().await?;
        Ok(rotated)
    }

    /// The identity pinned for `user_id`, if any.
    pub fn trusted_identity(&self, user_id: &str) -> Option<TrustedIdentity> {
        self.trust.get(user_id)
    }

    /// Accepts `identity` for `user_id`, replacing whatever was pinned.
    pub async fn trust_identity(
        &self,
        user_id: &str,
        identity: &IdentityPublicKey,
    ) -> Result<(), Error> {
        self.trust.trust(user_id, identity);
        tracing::debug!(user_id, "identity trusted");
        self.persist_account().await
    }

    /// Records that `identity` was verified out of band for `user_id`.
    pub async fn mark_verified(
        &self,
        user_id: &str,
        identity: &IdentityPublicKey,
    ) -> Result<(), Error> {
        self.trust.mark_verified(user_id, identity)?;
        self.persist_account().await
    }

    /// Safety number for comparing identities with `user_id`.
    pub fn fingerprint(&self, user_id: &str, identity: &IdentityPublicKey) -> Fingerprint {
        Fingerprint::new(
            self.identity.account_id(),
            &self.identity.public_key(),
            user_id,
            identity,
        )
    }

    /// Deletes every session and the account record from storage.
    pub async fn wipe(self) -> Result<(), Error> {
        let slots: Vec<String> = self.lock_index().iter().cloned().collect();
        for slot in &slots {
            self.store.delete(slot).await?;
        }
        self.store
            .delete(&account_slot(self.identity.account_id()))
            .await?;

        tracing::debug!(
            account_id = self.identity.account_id(),
            sessions = slots.len(),
            "wiped account"
        );

        Ok(())
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<SessionKey, Arc<AsyncMutex<SessionSlot>>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_index(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.session_index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn session_key(&self, remote_user_id: &str, remote_device_id: u32) -> SessionKey {
        SessionKey::new(self.identity.account_id(), remote_user_id, remote_device_id)
    }

    fn slot(&self, key: &SessionKey) -> Arc<AsyncMutex<SessionSlot>> {
        Arc::clone(self.lock_sessions().entry(key.clone()).or_default())
    }

    async fn ensure_loaded(&self, key: &SessionKey, slot: &mut SessionSlot) -> Result<(), Error> {
        if slot.loaded {
            return Ok(());
        }

        let name = key.storage_key();
        if let Some(sealed) = self.store.load(&name).await? {
            let session = Session::deserialize(&open(&self.storage_key, &name, &sealed)?)?;
            tracing::debug!(session = %key, "restored session");
            slot.established = Some(session);
        }
        slot.loaded = true;

        Ok(())
    }

    /// Writes `session` to its slot.
    ///
    /// The account record goes first whenever it has to change: for a session
    /// new to the index, or when the caller already changed account state
    /// (`account_changed`). A failed account write therefore never leaves a
    /// session blob behind. If the session blob itself fails, the account
    /// record may list a slot that is missing or stale, which `wipe` and
    /// `open` tolerate.
    async fn persist_session(
        &self,
        key: &SessionKey,
        session: &Session,
        account_changed: bool,
    ) -> Result<(), Error> {
        let name = key.storage_key();
        let sealed = seal(
            &self.storage_key,
            &name,
            &session.serialize(),
            self.entropy.as_ref(),
        )?;

        let indexed = self.lock_index().insert(name.clone());
        if indexed || account_changed {
            if let Err(err) = self.persist_account().await {
                if indexed {
                    self.lock_index().remove(&name);
                }
                return Err(err);
            }
        }

        if let Err(err) = self.store.save(&name, sealed).await {
            tracing::warn!(session = %key, %err, "failed to persist session");
            return Err(err.into());
        }

        Ok(())
    }

    async fn persist_account(&self) -> Result<(), Error> {
        let _write = self.account_write.lock().await;

        let account_id = self.identity.account_id();
        let sessions: Vec<String> = self.lock_index().iter().cloned().collect();
        let record = encode_account(
            account_id,
            self.device_id,
            self.registration_id,
            self.identity.key(),
            &self.pre_keys,
            self.trust.entries(),
            sessions,
        );

        let slot = account_slot(account_id);
        let sealed = seal(&self.storage_key, &slot, &record, self.entropy.as_ref())?;
        if let Err(err) = self.store.save(&slot, sealed).await {
            tracing::warn!(account_id, %err, "failed to persist account");
            return Err(err.into());
        }

        Ok(())
    }

    /// Decrypts with an existing session and commits the advanced state.
    async fn decrypt_existing(
        &self,
        key: &SessionKey,
        slot: &mut SessionSlot,
        message: &RatchetMessage,
        context: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let mut session = slot
            .established
            .clone()
            .ok_or_else(|| Error::NoSession(key.to_string()))?;

        let plaintext = match session.decrypt(message, context, self.entropy.as_ref()) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                tracing::warn!(session = %key, %err, "rejected message");
                return Err(err);
            }
        };

        self.persist_session(key, &session, false).await?;
        slot.established = Some(session);

        Ok(plaintext)
    }

    /// Responder half of the handshake. Nothing is changed unless the carried
    /// message authenticates; the one-time pre-key is consumed last.
    fn accept_handshake(
        &self,
        remote_user_id: &str,
        message: &PreKeyMessage,
    ) -> Result<(Session, Vec<u8>, Option<OneTimePreKey>), Error> {
        self.trust.check(remote_user_id, &message.identity)?;

        let signed_pre_key = self
            .pre_keys
            .signed_pre_key(message.signed_pre_key_id)
            .ok_or_else(|| {
                Error::PreKey(format!(
                    "Unknown signed pre-key {}",
                    message.signed_pre_key_id
                ))
            })?;

        let one_time_pre_key = match message.one_time_pre_key_id {
            Some(id) => Some(
                self.pre_keys
                    .one_time_pre_key(id)
                    .ok_or_else(|| Error::PreKey(format!("Unknown one-time pre-key {id}")))?,
            ),
            None => None,
        };

        let local = self.identity.public_key();
        let shared_secret = X3DH::new(&self.config.protocol_info).respond(
            self.identity.key(),
            &signed_pre_key,
            one_time_pre_key.as_ref(),
            &message.identity.dh_key(),
            &message.base_key,
        )?;

        let ratchet = DoubleRatchet::initialize_for_bob(
            shared_secret,
            signed_pre_key.key_pair().clone(),
            associated_data(&message.identity, &local),
            self.config.max_skip,
            self.config.max_skipped_message_keys,
        );

        let mut session = Session::new(
            ratchet,
            message.identity,
            message.registration_id,
            message.base_key,
            None,
            &message.identity,
            &local,
        );
        let plaintext = session.decrypt(
            &message.message,
            &message.handshake_prefix(),
            self.entropy.as_ref(),
        )?;

        let consumed = match message.one_time_pre_key_id {
            Some(id) => Some(self.pre_keys.consume_one_time(id).ok_or_else(|| {
                Error::PreKey(format!("One-time pre-key {id} already consumed"))
            })?),
            None => None,
        };

        Ok((session, plaintext, consumed))
    }

    async fn decrypt_handshake(
        &self,
        remote_user_id: &str,
        key: &SessionKey,
        slot: &mut SessionSlot,
        message: &PreKeyMessage,
    ) -> Result<Vec<u8>, Error> {
        // Repeats of a handshake we already accepted carry the same base key
        // and must agree with it on every other field too.
        let repeat = match slot.established.as_ref() {
            Some(session) if session.base_key == message.base_key => Some(
                session.remote_identity == message.identity
                    && session.remote_registration_id == message.registration_id,
            ),
            _ => None,
        };
        match repeat {
            Some(true) => {
                let context = message.handshake_prefix();
                return self
                    .decrypt_existing(key, slot, &message.message, &context)
                    .await;
            }
            Some(false) => {
                tracing::warn!(session = %key, "repeated handshake does not match the accepted one");
                return Err(Error::AuthenticationFailed);
            }
            None => {}
        }

        let (session, plaintext, consumed) =
            match self.accept_handshake(remote_user_id, message) {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(session = %key, %err, "rejected handshake");
                    return Err(err);
                }
            };

        // The account record drops the consumed one-time pre-key before the
        // session is written; a handshake that cannot record that fails.
        let pinned = self.trust.record(remote_user_id, &message.identity);
        let account_changed = pinned || consumed.is_some();
        if let Err(err) = self.persist_session(key, &session, account_changed).await {
            if pinned {
                self.trust.forget(remote_user_id);
            }
            // No handshake succeeded with it, so the same message may retry.
            if let Some(one_time_pre_key) = consumed {
                self.pre_keys.restore_one_time(one_time_pre_key);
            }
            return Err(err);
        }

        tracing::debug!(
            session = %key,
            session_id = session.session_id(),
            one_time_pre_key = ?message.one_time_pre_key_id,
            "accepted handshake"
        );

        slot.established = Some(session);

        Ok(plaintext)
    }
}

#[async_trait]
impl<S: SessionStore> SessionEngine for Account<S> {
    fn local_user_id(&self) -> &str {
        self.identity.account_id()
    }

    fn local_device_id(&self) -> u32 {
        self.device_id
    }

    fn identity_public_key(&self) -> IdentityPublicKey {
        self.identity.public_key()
    }

    async fn session_state(
        &self,
        remote_user_id: &str,
        remote_device_id: u32,
    ) -> Result<SessionState, Error> {
        let key = self.session_key(remote_user_id, remote_device_id);
        let slot = self.slot(&key);
        let mut slot = slot.lock().await;
        self.ensure_loaded(&key, &mut slot).await?;

        Ok(if slot.pending.is_some() {
            SessionState::Pending
        } else if slot.established.is_some() {
            SessionState::Established
        } else {
            SessionState::NoSession
        })
    }

    async fn initiate_session(
        &self,
        remote_user_id: &str,
        bundle: &PreKeyBundle,
    ) -> Result<(), Error> {
        let key = self.session_key(remote_user_id, bundle.device_id);

        if let Err(err) = self.trust.check(remote_user_id, &bundle.identity) {
            tracing::warn!(session = %key, "bundle identity does not match pinned identity");
            return Err(err);
        }

        let initiation = match X3DH::new(&self.config.protocol_info).initiate(
            self.identity.key(),
            bundle,
            self.entropy.as_ref(),
        ) {
            Ok(initiation) => initiation,
            Err(err) => {
                tracing::warn!(session = %key, %err, "handshake aborted");
                return Err(err);
            }
        };

        let local = self.identity.public_key();
        let base_key = initiation.public_key();
        let ratchet = DoubleRatchet::initialize_for_alice(
            initiation.shared_secret(),
            &bundle.signed_pre_key,
            associated_data(&local, &bundle.identity),
            self.config.max_skip,
            self.config.max_skipped_message_keys,
            self.entropy.as_ref(),
        )?;

        let session = Session::new(
            ratchet,
            bundle.identity,
            bundle.registration_id,
            base_key,
            Some(HandshakeInfo {
                signed_pre_key_id: bundle.signed_pre_key_id,
                one_time_pre_key_id: bundle.one_time_pre_key.map(|(id, _)| id),
            }),
            &local,
            &bundle.identity,
        );

        tracing::debug!(
            session = %key,
            session_id = session.session_id(),
            one_time_pre_key = bundle.one_time_pre_key.is_some(),
            "initiated handshake"
        );

        {
            let slot = self.slot(&key);
            let mut slot = slot.lock().await;
            self.ensure_loaded(&key, &mut slot).await?;
            slot.pending = Some(session);
        }

        if self.trust.record(remote_user_id, &bundle.identity) {
            self.persist_account().await?;
        }

        Ok(())
    }

    async fn abandon_handshake(&self, remote_user_id: &str, remote_device_id: u32) -> bool {
        let key = self.session_key(remote_user_id, remote_device_id);
        let slot = self.slot(&key);
        let abandoned = slot.lock().await.pending.take().is_some();

        if abandoned {
            tracing::debug!(session = %key, "abandoned handshake");
        }
        abandoned
    }

    async fn encrypt(
        &self,
        remote_user_id: &str,
        remote_device_id: u32,
        plaintext: &[u8],
    ) -> Result<Envelope, Error> {
        let key = self.session_key(remote_user_id, remote_device_id);
        let slot = self.slot(&key);
        let mut slot = slot.lock().await;
        self.ensure_loaded(&key, &mut slot).await?;

        let promoting = slot.pending.is_some();
        let mut session = slot
            .pending
            .as_ref()
            .or(slot.established.as_ref())
            .cloned()
            .ok_or_else(|| Error::NoSession(key.to_string()))?;

        let envelope = session.encrypt(
            plaintext,
            &self.identity.public_key(),
            self.registration_id,
        )?;

        self.persist_session(&key, &session, false).await?;
        slot.established = Some(session);
        if promoting {
            slot.pending = None;
            tracing::debug!(session = %key, "session established");
        }

        Ok(envelope)
    }

    async fn decrypt(
        &self,
        remote_user_id: &str,
        remote_device_id: u32,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, Error> {
        let key = self.session_key(remote_user_id, remote_device_id);
        let slot = self.slot(&key);
        let mut slot = slot.lock().await;
        self.ensure_loaded(&key, &mut slot).await?;

        match envelope {
            Envelope::Ratchet(message) => {
                self.decrypt_existing(&key, &mut slot, message, &[]).await
            }
            Envelope::PreKeyHandshake(message) => {
                self.decrypt_handshake(remote_user_id, &key, &mut slot, message)
                    .await
            }
        }
    }

    async fn delete_session(
        &self,
        remote_user_id: &str,
        remote_device_id: u32,
    ) -> Result<(), Error> {
        let key = self.session_key(remote_user_id, remote_device_id);
        let slot = self.slot(&key);
        let mut slot = slot.lock().await;

        let name = key.storage_key();
        self.store.delete(&name).await?;
        *slot = SessionSlot {
            loaded: true,
            ..SessionSlot::default()
        };

        let removed = self.lock_index().remove(&name);
        if removed {
            self.persist_account().await?;
        }

        tracing::debug!(session = %key, "deleted session");

        Ok(())
    }
}
