//! Wire format for encrypted messages.
//!
//! Every envelope starts with a version byte and a type tag. All integers are
//! big-endian and fixed width; the only variable-length fields are
//! `u32`-length-prefixed. Decoding rejects unknown versions, unknown tags,
//! truncated fields and trailing bytes.
//!
//! ```text
//! envelope  = version:u8 type:u8 body
//! ratchet   = ratchet_key:32 previous_chain_length:u32 counter:u32 ciphertext_len:u32 ciphertext
//! pre-key   = registration_id:u32 identity_dh:32 identity_signing:32 base_key:32
//!             signed_pre_key_id:u32 has_one_time:u8 [one_time_pre_key_id:u32]
//!             inner_len:u32 ratchet
//! ```
//!
//! Everything of a pre-key envelope before `inner_len` is its handshake
//! prefix. The inner message authenticates that prefix along with its own
//! header, so no handshake field can be altered in transit. Public keys must
//! be canonical: the top bit of the last byte is always clear.

mod reader;

use crate::keys::IdentityPublicKey;
use crate::{Error, X25519PublicKey};
use reader::Reader;

/// Version written by this implementation.
pub const PROTOCOL_VERSION: u8 = 1;
/// Oldest version this implementation still reads.
pub const MIN_PROTOCOL_VERSION: u8 = 1;

const TYPE_PRE_KEY_HANDSHAKE: u8 = 1;
const TYPE_RATCHET: u8 = 2;

/// Length of the ratchet header bound into every message's associated data.
pub const HEADER_LEN: usize = 40;

/// Picks the highest version both sides support.
pub fn negotiate_version(peer_min: u8, peer_max: u8) -> Result<u8, Error> {
    let version = peer_max.min(PROTOCOL_VERSION);
    if peer_min > peer_max || version < peer_min.max(MIN_PROTOCOL_VERSION) {
        return Err(Error::MalformedEnvelope(format!(
            "no common protocol version with peer range {peer_min}..={peer_max}"
        )));
    }
    Ok(version)
}

/// A Double Ratchet message: plaintext header plus AEAD ciphertext.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RatchetMessage {
    /// Sender's current ratchet public key.
    pub ratchet_key: X25519PublicKey,
    /// Length of the sender's previous sending chain.
    pub previous_chain_length: u32,
    /// Index of this message in the current sending chain.
    pub counter: u32,
    /// Encrypted payload including the authentication tag.
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    /// The 40-byte header authenticated alongside the ciphertext.
    pub fn header_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..32].copy_from_slice(self.ratchet_key.as_bytes());
        bytes[32..36].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        bytes[36..40].copy_from_slice(&self.counter.to_be_bytes());
        bytes
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), Error> {
        out.extend_from_slice(&self.header_bytes());
        put_prefixed(out, &self.ciphertext, "ciphertext")
    }

    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let ratchet_key = reader.read_public_key("ratchet key")?;
        let previous_chain_length = reader.read_u32("previous chain length")?;
        let counter = reader.read_u32("counter")?;
        let ciphertext = reader.read_prefixed("ciphertext")?.to_vec();

        Ok(Self {
            ratchet_key,
            previous_chain_length,
            counter,
            ciphertext,
        })
    }
}

/// First messages of a session: everything the responder needs to complete
/// the handshake, wrapping an ordinary ratchet message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreKeyMessage {
    /// Registration id of the sending device.
    pub registration_id: u32,
    /// Initiator's long-term identity.
    pub identity: IdentityPublicKey,
    /// Initiator's handshake ephemeral key.
    pub base_key: X25519PublicKey,
    /// Responder's signed pre-key the handshake used.
    pub signed_pre_key_id: u32,
    /// Responder's one-time pre-key the handshake used, if any.
    pub one_time_pre_key_id: Option<u32>,
    /// The first ratchet message.
    pub message: RatchetMessage,
}

impl PreKeyMessage {
    /// Encoded handshake fields, bound into the inner message's associated data.
    pub fn handshake_prefix(&self) -> Vec<u8> {
        handshake_prefix(
            self.registration_id,
            &self.identity,
            &self.base_key,
            self.signed_pre_key_id,
            self.one_time_pre_key_id,
        )
    }
}

/// `version type registration_id identity base_key signed_pre_key_id has_one_time [one_time_pre_key_id]`
pub(crate) fn handshake_prefix(
    registration_id: u32,
    identity: &IdentityPublicKey,
    base_key: &X25519PublicKey,
    signed_pre_key_id: u32,
    one_time_pre_key_id: Option<u32>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(111);
    out.push(PROTOCOL_VERSION);
    out.push(TYPE_PRE_KEY_HANDSHAKE);
    out.extend_from_slice(&registration_id.to_be_bytes());
    out.extend_from_slice(&identity.to_bytes());
    out.extend_from_slice(base_key.as_bytes());
    out.extend_from_slice(&signed_pre_key_id.to_be_bytes());
    match one_time_pre_key_id {
        Some(id) => {
            out.push(1);
            out.extend_from_slice(&id.to_be_bytes());
        }
        None => out.push(0),
    }
    out
}

/// An encoded unit of transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Envelope {
    /// Sent until the initiator has heard back from the responder.
    PreKeyHandshake(PreKeyMessage),
    /// Sent once the session is established.
    Ratchet(RatchetMessage),
}

impl Envelope {
    /// The ratchet message carried by either variant.
    pub fn ratchet_message(&self) -> &RatchetMessage {
        match self {
            Self::PreKeyHandshake(message) => &message.message,
            Self::Ratchet(message) => message,
        }
    }

    /// Serializes the envelope at [`PROTOCOL_VERSION`].
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::PreKeyHandshake(message) => {
                let mut out = message.handshake_prefix();

                let mut inner = Vec::with_capacity(HEADER_LEN + 4 + message.message.ciphertext.len());
                message.message.encode_into(&mut inner)?;
                put_prefixed(&mut out, &inner, "inner message")?;
                Ok(out)
            }
            Self::Ratchet(message) => {
                let mut out = Vec::with_capacity(2 + HEADER_LEN + 4 + message.ciphertext.len());
                out.push(PROTOCOL_VERSION);
                out.push(TYPE_RATCHET);
                message.encode_into(&mut out)?;
                Ok(out)
            }
        }
    }

    /// Parses an envelope. Never panics; any structural problem is
    /// [`Error::MalformedEnvelope`].
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);

        let version = reader.read_u8("version")?;
        if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
            return Err(Error::MalformedEnvelope(format!(
                "unsupported version {version}"
            )));
        }

        let envelope = match reader.read_u8("type")? {
            TYPE_PRE_KEY_HANDSHAKE => {
                let registration_id = reader.read_u32("registration id")?;
                let identity = IdentityPublicKey::from_bytes(&reader.read_array::<64>("identity")?)
                    .map_err(|err| Error::MalformedEnvelope(err.to_string()))?;
                let base_key = reader.read_public_key("base key")?;
                let signed_pre_key_id = reader.read_u32("signed pre-key id")?;
                let one_time_pre_key_id = match reader.read_u8("one-time pre-key flag")? {
                    0 => None,
                    1 => Some(reader.read_u32("one-time pre-key id")?),
                    flag => {
                        return Err(Error::MalformedEnvelope(format!(
                            "invalid one-time pre-key flag {flag}"
                        )));
                    }
                };

                let mut inner = Reader::new(reader.read_prefixed("inner message")?);
                let message = RatchetMessage::decode_from(&mut inner)?;
                inner.finish()?;

                Self::PreKeyHandshake(PreKeyMessage {
                    registration_id,
                    identity,
                    base_key,
                    signed_pre_key_id,
                    one_time_pre_key_id,
                    message,
                })
            }
            TYPE_RATCHET => Self::Ratchet(RatchetMessage::decode_from(&mut reader)?),
            tag => {
                return Err(Error::MalformedEnvelope(format!("unknown type {tag}")));
            }
        };

        reader.finish()?;
        Ok(envelope)
    }
}

fn put_prefixed(out: &mut Vec<u8>, bytes: &[u8], what: &str) -> Result<(), Error> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::MalformedEnvelope(format!("{what} too long")))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{IdentityKey, OsEntropy};
    use crate::X25519Secret;
    use proptest::prelude::*;

    fn public_key() -> X25519PublicKey {
        X25519Secret::generate(&OsEntropy).unwrap().public_key()
    }

    fn ratchet_message() -> RatchetMessage {
        RatchetMessage {
            ratchet_key: public_key(),
            previous_chain_length: 3,
            counter: 7,
            ciphertext: b"ciphertext and tag".to_vec(),
        }
    }

    fn pre_key_message(one_time_pre_key_id: Option<u32>) -> PreKeyMessage {
        PreKeyMessage {
            registration_id: 4242,
            identity: IdentityKey::generate(&OsEntropy).unwrap().public_key(),
            base_key: public_key(),
            signed_pre_key_id: 2,
            one_time_pre_key_id,
            message: ratchet_message(),
        }
    }

    #[test]
    fn test_ratchet_envelope_layout() {
        let message = ratchet_message();
        let bytes = Envelope::Ratchet(message.clone()).encode().unwrap();

        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], TYPE_RATCHET);
        assert_eq!(&bytes[2..42], &message.header_bytes());
        assert_eq!(&bytes[42..46], &18u32.to_be_bytes());
        assert_eq!(bytes.len(), 46 + 18);

        assert_eq!(Envelope::decode(&bytes).unwrap(), Envelope::Ratchet(message));
    }

    #[test]
    fn test_pre_key_envelope_decodes() {
        for one_time in [Some(9), None] {
            let envelope = Envelope::PreKeyHandshake(pre_key_message(one_time));
            let bytes = envelope.encode().unwrap();
            assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
        }
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut bytes = Envelope::Ratchet(ratchet_message()).encode().unwrap();
        bytes[0] = PROTOCOL_VERSION + 1;

        assert!(matches!(
            Envelope::decode(&bytes),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_type() {
        let mut bytes = Envelope::Ratchet(ratchet_message()).encode().unwrap();
        bytes[1] = 0x7f;

        assert!(matches!(
            Envelope::decode(&bytes),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut bytes = Envelope::PreKeyHandshake(pre_key_message(Some(1)))
            .encode()
            .unwrap();
        bytes.push(0);

        assert!(matches!(
            Envelope::decode(&bytes),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let mut bytes = Envelope::Ratchet(ratchet_message()).encode().unwrap();
        // Claim one more ciphertext byte than is present.
        bytes[45] += 1;

        assert!(matches!(
            Envelope::decode(&bytes),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_rejects_bad_one_time_flag() {
        let mut bytes = Envelope::PreKeyHandshake(pre_key_message(None))
            .encode()
            .unwrap();
        // version, type, registration id, identity, base key, signed pre-key id
        let flag = 2 + 4 + 64 + 32 + 4;
        bytes[flag] = 2;

        assert!(matches!(
            Envelope::decode(&bytes),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_handshake_prefix_matches_encoding() {
        for one_time in [Some(9), None] {
            let message = pre_key_message(one_time);
            let prefix = message.handshake_prefix();
            let bytes = Envelope::PreKeyHandshake(message).encode().unwrap();

            assert_eq!(&bytes[..prefix.len()], prefix.as_slice());
            assert_eq!(prefix.len(), if one_time.is_some() { 111 } else { 107 });
        }
    }

    #[test]
    fn test_rejects_non_canonical_keys() {
        let bytes = Envelope::PreKeyHandshake(pre_key_message(Some(1)))
            .encode()
            .unwrap();

        // Top bits of the base key and of the inner ratchet key.
        let base_key_top = 2 + 4 + 64 + 31;
        let ratchet_key_top = 111 + 4 + 31;
        for offset in [base_key_top, ratchet_key_top] {
            let mut tampered = bytes.clone();
            tampered[offset] |= 0x80;
            assert!(matches!(
                Envelope::decode(&tampered),
                Err(Error::MalformedEnvelope(_))
            ));
        }
    }

    #[test]
    fn test_version_negotiation() {
        assert_eq!(negotiate_version(1, 1), Ok(1));
        assert_eq!(negotiate_version(1, 5), Ok(PROTOCOL_VERSION));
        assert!(negotiate_version(2, 5).is_err());
        assert!(negotiate_version(3, 1).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(512))]

        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = Envelope::decode(&bytes);
        }

        #[test]
        fn prop_truncation_is_rejected(cut in 0usize..64) {
            let bytes = Envelope::Ratchet(ratchet_message()).encode().unwrap();
            let cut = cut.min(bytes.len() - 1);
            prop_assert!(Envelope::decode(&bytes[..cut]).is_err());
        }
    }
}
