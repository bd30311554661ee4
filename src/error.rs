use crate::store::StorageError;

/// Errors that can occur during session and key-management operations.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// The platform random source failed. Nothing is generated from fallback entropy.
    #[error("Platform entropy source unavailable")]
    EntropyUnavailable,

    /// A pre-key bundle failed signature verification.
    #[error("Untrusted pre-key: {0}")]
    UntrustedPreKey(String),

    /// A remote user presented an identity key different from the trusted one.
    #[error("Untrusted identity for {0}")]
    UntrustedIdentity(String),

    /// A ciphertext failed to authenticate, or its message key was already consumed.
    #[error("Message authentication failed")]
    AuthenticationFailed,

    /// An envelope could not be decoded.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The local one-time pre-key pool is empty.
    #[error("One-time pre-keys exhausted")]
    OneTimePreKeyExhausted,

    /// A conversation already holds the maximum number of devices.
    #[error("Device limit of {limit} exceeded")]
    DeviceLimitExceeded {
        /// Configured device ceiling.
        limit: usize,
    },

    /// A referenced local pre-key is unknown or already consumed.
    #[error("Pre-key error: {0}")]
    PreKey(String),

    /// No session exists for the given peer device.
    #[error("No session for {0}")]
    NoSession(String),

    /// No conversation exists for the given user.
    #[error("Unknown recipient {0}")]
    UnknownRecipient(String),

    /// The device is not part of the conversation.
    #[error("Unknown device {0}")]
    UnknownDevice(u32),

    /// The message was already delivered to this conversation.
    #[error("Duplicate message")]
    DuplicateMessage,

    /// The directory holds no pre-key bundle for the requested device.
    #[error("Pre-key bundle unavailable for {0}")]
    BundleUnavailable(String),

    /// A cryptographic primitive failed.
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    /// Serialization or deserialization failed.
    #[error("Serialization/deserialization failed: {0}")]
    Serde(String),

    /// The persistence layer failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<aes_gcm_siv::Error> for Error {
    fn from(value: aes_gcm_siv::Error) -> Self {
        Self::Crypto(value.to_string())
    }
}
