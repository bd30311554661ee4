use crate::Error;
use crate::keys::IdentityPublicKey;
use std::collections::{BTreeMap, HashSet, VecDeque};

/// One registered device of a remote user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// Owner of the device.
    pub user_id: String,
    /// Device id, unique per user.
    pub device_id: u32,
    /// Registration id the device announced, 0 when not yet known.
    pub registration_id: u32,
    /// Identity seen in the device's handshake, if one arrived.
    pub identity: Option<IdentityPublicKey>,
    /// Human-readable label such as "Laptop".
    pub name: Option<String>,
}

impl Device {
    /// A device known only by its address.
    pub fn new(user_id: &str, device_id: u32) -> Self {
        Self {
            user_id: user_id.to_string(),
            device_id,
            registration_id: 0,
            identity: None,
            name: None,
        }
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// (sender device, ratchet key, counter)
pub(crate) type MessageId = (u32, [u8; 32], u32);

/// The device set of one remote user plus a window of recently delivered
/// message ids.
#[derive(Clone, Debug)]
pub struct Conversation {
    user_id: String,
    devices: BTreeMap<u32, Device>,
    seen: HashSet<MessageId>,
    seen_order: VecDeque<MessageId>,
}

impl Conversation {
    pub(crate) fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            devices: BTreeMap::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// The remote user.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Registered devices ordered by id.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Looks up a registered device.
    pub fn device(&self, device_id: u32) -> Option<&Device> {
        self.devices.get(&device_id)
    }

    /// Whether another device fits under `limit`.
    pub(crate) fn has_room(&self, limit: usize) -> bool {
        self.devices.len() < limit
    }

    /// Adds or updates a device. New devices beyond `limit` are rejected.
    pub(crate) fn upsert_device(&mut self, device: Device, limit: usize) -> Result<(), Error> {
        if !self.devices.contains_key(&device.device_id) && !self.has_room(limit) {
            return Err(Error::DeviceLimitExceeded { limit });
        }
        self.devices.insert(device.device_id, device);
        Ok(())
    }

    pub(crate) fn remove_device(&mut self, device_id: u32) -> Option<Device> {
        self.devices.remove(&device_id)
    }

    pub(crate) fn is_duplicate(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    /// Remembers a delivered message, forgetting the oldest beyond `window`.
    pub(crate) fn remember(&mut self, id: MessageId, window: usize) {
        if window == 0 || !self.seen.insert(id) {
            return;
        }
        self.seen_order.push_back(id);

        while self.seen_order.len() > window {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_limit() {
        let mut conversation = Conversation::new("bob");

        conversation.upsert_device(Device::new("bob", 1), 2).unwrap();
        conversation.upsert_device(Device::new("bob", 2), 2).unwrap();
        assert_eq!(
            conversation.upsert_device(Device::new("bob", 3), 2),
            Err(Error::DeviceLimitExceeded { limit: 2 })
        );

        // Updating a known device is always allowed.
        conversation
            .upsert_device(Device::new("bob", 2).with_name("Tablet"), 2)
            .unwrap();
        assert_eq!(
            conversation.device(2).and_then(|d| d.name.as_deref()),
            Some("Tablet")
        );

        conversation.remove_device(1);
        assert!(conversation.upsert_device(Device::new("bob", 3), 2).is_ok());
    }

    #[test]
    fn test_dedup_window_forgets_oldest() {
        let mut conversation = Conversation::new("bob");
        let id = |counter| (1, [0u8; 32], counter);

        for counter in 0..4 {
            conversation.remember(id(counter), 3);
        }

        assert!(!conversation.is_duplicate(&id(0)));
        assert!(conversation.is_duplicate(&id(1)));
        assert!(conversation.is_duplicate(&id(3)));
        assert!(!conversation.is_duplicate(&(2, [0u8; 32], 3)));
    }
}
