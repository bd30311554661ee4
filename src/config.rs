use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Tunables for an [`Account`](crate::Account) and the sessions it owns.
#[derive(Clone, Debug)]
pub struct AccountConfig {
    /// Largest counter gap a single incoming message may open on one chain.
    pub max_skip: u32,
    /// Ceiling on cached out-of-order message keys per session. Oldest entries are evicted first.
    pub max_skipped_message_keys: usize,
    /// How often the signed pre-key is replaced.
    pub signed_pre_key_rotation_interval: Duration,
    /// How long a replaced signed pre-key stays usable for in-flight handshakes.
    pub signed_pre_key_retention: Duration,
    /// Pool size below which one-time pre-keys are replenished.
    pub min_one_time_pre_keys: usize,
    /// Pool size replenishment tops up to.
    pub max_one_time_pre_keys: usize,
    /// Application context bound into every handshake derivation.
    pub protocol_info: Vec<u8>,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            max_skip: 1000,
            max_skipped_message_keys: 1000,
            signed_pre_key_rotation_interval: DAY * 7,
            signed_pre_key_retention: DAY * 14,
            min_one_time_pre_keys: 20,
            max_one_time_pre_keys: 100,
            protocol_info: b"Vault-E2EE-v1".to_vec(),
        }
    }
}

/// Tunables for [`DeviceFanout`](crate::DeviceFanout).
#[derive(Clone, Debug)]
pub struct FanoutConfig {
    /// Maximum devices per conversation, the primary included.
    pub max_devices: usize,
    /// Number of recently delivered messages remembered per conversation.
    pub dedup_window: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_devices: 6,
            dedup_window: 2048,
        }
    }
}
