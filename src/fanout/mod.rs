//! Multi-device delivery.
//!
//! A logical message to a user is encrypted independently for each of the
//! user's devices. One device failing never blocks the others; every outcome is
//! reported per device.

mod conversation;
pub use conversation::{Conversation, Device};

use crate::engine::SessionEngine;
use crate::envelope::Envelope;
use crate::prekey::PreKeyDirectory;
use crate::session::SessionState;
use crate::{Error, FanoutConfig};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Outcome of sending to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDelivery {
    /// The target device.
    pub device_id: u32,
    /// Encoded envelope to hand to the transport, or why there is none.
    pub result: Result<Vec<u8>, Error>,
}

/// Fans messages out to every device of a remote user.
pub struct DeviceFanout<E: SessionEngine, D: PreKeyDirectory> {
    engine: E,
    directory: D,
    config: FanoutConfig,
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl<E: SessionEngine, D: PreKeyDirectory> DeviceFanout<E, D> {
    /// Creates a fanout over `engine`, fetching missing bundles from `directory`.
    pub fn new(engine: E, directory: D, config: FanoutConfig) -> Self {
        Self {
            engine,
            directory,
            config,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying session engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The pre-key directory.
    pub fn directory(&self) -> &D {
        &self.directory
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Conversation>> {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a device, or updates one already registered.
    ///
    /// Fails with [`Error::DeviceLimitExceeded`] when the user already has
    /// `max_devices` devices.
    pub fn add_device(&self, device: Device) -> Result<(), Error> {
        let mut conversations = self.lock();
        let conversation = conversations
            .entry(device.user_id.clone())
            .or_insert_with(|| Conversation::new(&device.user_id));

        let (user_id, device_id) = (device.user_id.clone(), device.device_id);
        conversation.upsert_device(device, self.config.max_devices)?;

        tracing::debug!(user_id, device_id, "device registered");
        Ok(())
    }

    /// Unregisters a device and deletes its session.
    pub async fn remove_device(
        &self,
        user_id: &str,
        device_id: u32,
    ) -> Result<Option<Device>, Error> {
        let removed = self
            .lock()
            .get_mut(user_id)
            .and_then(|conversation| conversation.remove_device(device_id));

        if removed.is_some() {
            self.engine.delete_session(user_id, device_id).await?;
            tracing::debug!(user_id, device_id, "device removed");
        }

        Ok(removed)
    }

    /// Forgets `user_id`: deletes the session with each registered device,
    /// then drops the conversation and its duplicate window. Returns the
    /// devices that were registered.
    ///
    /// If a session cannot be deleted the conversation is kept, so the call
    /// can be repeated.
    pub async fn unlink(&self, user_id: &str) -> Result<Vec<Device>, Error> {
        let devices = self.devices(user_id);
        for device in &devices {
            self.engine.delete_session(user_id, device.device_id).await?;
        }

        let removed = self.lock().remove(user_id).is_some();
        if removed {
            tracing::debug!(user_id, devices = devices.len(), "unlinked user");
        }

        Ok(devices)
    }

    /// Snapshot of a user's registered devices.
    pub fn devices(&self, user_id: &str) -> Vec<Device> {
        self.lock()
            .get(user_id)
            .map(|conversation| conversation.devices().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the conversation with `user_id`.
    pub fn conversation(&self, user_id: &str) -> Option<Conversation> {
        self.lock().get(user_id).cloned()
    }

    /// Encrypts `plaintext` for every registered device of `user_id`.
    ///
    /// Devices without a session get one from a freshly fetched bundle. The
    /// call itself only fails when the user has no conversation; everything
    /// else is reported per device. The local device is skipped when sending
    /// to the local user's other devices.
    pub async fn send(
        &self,
        user_id: &str,
        plaintext: &[u8],
    ) -> Result<Vec<DeviceDelivery>, Error> {
        let device_ids: Vec<u32> = match self.lock().get(user_id) {
            Some(conversation) => conversation.devices().map(|d| d.device_id).collect(),
            None => return Err(Error::UnknownRecipient(user_id.to_string())),
        };

        let own = user_id == self.engine.local_user_id();
        let mut deliveries = Vec::with_capacity(device_ids.len());

        for device_id in device_ids {
            if own && device_id == self.engine.local_device_id() {
                continue;
            }

            let result = self.deliver(user_id, device_id, plaintext).await;
            if let Err(err) = &result {
                tracing::warn!(user_id, device_id, %err, "delivery to device failed");
            }
            deliveries.push(DeviceDelivery { device_id, result });
        }

        tracing::debug!(
            user_id,
            devices = deliveries.len(),
            delivered = deliveries.iter().filter(|d| d.result.is_ok()).count(),
            "fanned out message"
        );

        Ok(deliveries)
    }

    async fn deliver(
        &self,
        user_id: &str,
        device_id: u32,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        if self.engine.session_state(user_id, device_id).await? == SessionState::NoSession {
            let bundle = self.directory.fetch(user_id, device_id).await?;
            if bundle.device_id != device_id {
                return Err(Error::BundleUnavailable(format!(
                    "{user_id}/{device_id} answered with device {}",
                    bundle.device_id
                )));
            }
            self.engine.initiate_session(user_id, &bundle).await?;
        }

        self.engine
            .encrypt(user_id, device_id, plaintext)
            .await?
            .encode()
    }

    /// Decodes and decrypts an envelope from `user_id`'s device `device_id`.
    ///
    /// A message already delivered to this conversation fails with
    /// [`Error::DuplicateMessage`] before the engine sees it. A handshake from
    /// an unregistered device registers it, within the device limit.
    pub async fn receive(
        &self,
        user_id: &str,
        device_id: u32,
        bytes: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let envelope = Envelope::decode(bytes)?;
        let message = envelope.ratchet_message();
        let message_id = (device_id, message.ratchet_key.to_bytes(), message.counter);
        let handshake = match &envelope {
            Envelope::PreKeyHandshake(handshake) => Some(handshake),
            Envelope::Ratchet(_) => None,
        };

        self.check_incoming(user_id, device_id, &message_id, handshake.is_some())?;

        let plaintext = self.engine.decrypt(user_id, device_id, &envelope).await?;

        let mut conversations = self.lock();
        let conversation = conversations
            .entry(user_id.to_string())
            .or_insert_with(|| Conversation::new(user_id));

        if let Some(handshake) = handshake {
            if conversation.device(device_id).is_none() {
                let device = Device {
                    user_id: user_id.to_string(),
                    device_id,
                    registration_id: handshake.registration_id,
                    identity: Some(handshake.identity),
                    name: None,
                };
                match conversation.upsert_device(device, self.config.max_devices) {
                    Ok(()) => tracing::debug!(user_id, device_id, "learned device from handshake"),
                    Err(err) => tracing::warn!(user_id, device_id, %err, "not registering device"),
                }
            }
        }
        conversation.remember(message_id, self.config.dedup_window);

        Ok(plaintext)
    }

    fn check_incoming(
        &self,
        user_id: &str,
        device_id: u32,
        message_id: &conversation::MessageId,
        is_handshake: bool,
    ) -> Result<(), Error> {
        let conversations = self.lock();
        let Some(conversation) = conversations.get(user_id) else {
            return if is_handshake {
                Ok(())
            } else {
                Err(Error::UnknownRecipient(user_id.to_string()))
            };
        };

        if conversation.is_duplicate(message_id) {
            tracing::warn!(user_id, device_id, "dropping duplicate message");
            return Err(Error::DuplicateMessage);
        }

        if conversation.device(device_id).is_none() {
            if !is_handshake {
                return Err(Error::UnknownDevice(device_id));
            }
            if !conversation.has_room(self.config.max_devices) {
                return Err(Error::DeviceLimitExceeded {
                    limit: self.config.max_devices,
                });
            }
        }

        Ok(())
    }
}
