//! Protocol Buffers records for everything the engine persists or ships.
//!
//! Messages are declared with `prost` derives rather than generated from a
//! `.proto` file, so no `protoc` is needed at build time. Every decoder checks
//! field lengths and reports [`Error::Serde`].

use crate::account::TrustedIdentity;
use crate::keys::{IdentityKey, IdentityPublicKey, OneTimePreKey, SignedPreKey};
use crate::prekey::{PreKeyBundle, PreKeyInner, PreKeyStore};
use crate::ratchet::{AD_LEN, Chain, RatchetState, SkippedKeys};
use crate::session::{HandshakeInfo, Session};
use crate::{DoubleRatchet, Error, X25519PublicKey, X25519Secret};
use ed25519_dalek::Signature;
use prost::Message;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const SCHEMA_VERSION: u32 = 1;

#[derive(Clone, PartialEq, Message)]
pub(crate) struct AccountRecord {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(string, tag = "2")]
    pub account_id: String,
    #[prost(uint32, tag = "3")]
    pub device_id: u32,
    #[prost(uint32, tag = "4")]
    pub registration_id: u32,
    #[prost(bytes = "vec", tag = "5")]
    pub identity_key: Vec<u8>,
    #[prost(message, repeated, tag = "6")]
    pub signed_pre_keys: Vec<SignedPreKeyRecord>,
    #[prost(uint32, tag = "7")]
    pub current_signed_pre_key_id: u32,
    #[prost(uint32, tag = "8")]
    pub next_signed_pre_key_id: u32,
    #[prost(message, repeated, tag = "9")]
    pub one_time_pre_keys: Vec<OneTimePreKeyRecord>,
    #[prost(uint32, tag = "10")]
    pub next_one_time_pre_key_id: u32,
    #[prost(message, repeated, tag = "11")]
    pub trusted_identities: Vec<TrustedIdentityRecord>,
    #[prost(string, repeated, tag = "12")]
    pub sessions: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct SignedPreKeyRecord {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub secret: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub signature: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub created_at: u64,
    #[prost(uint64, optional, tag = "5")]
    pub retired_at: Option<u64>,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct OneTimePreKeyRecord {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub secret: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct TrustedIdentityRecord {
    #[prost(string, tag = "1")]
    pub user_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub identity: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub verified: bool,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct SessionRecord {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(string, tag = "2")]
    pub session_id: String,
    #[prost(bytes = "vec", tag = "3")]
    pub remote_identity: Vec<u8>,
    #[prost(uint32, tag = "4")]
    pub remote_registration_id: u32,
    #[prost(bytes = "vec", tag = "5")]
    pub base_key: Vec<u8>,
    #[prost(message, optional, tag = "6")]
    pub handshake: Option<HandshakeRecord>,
    #[prost(message, optional, tag = "7")]
    pub ratchet: Option<RatchetRecord>,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct HandshakeRecord {
    #[prost(uint32, tag = "1")]
    pub signed_pre_key_id: u32,
    #[prost(uint32, optional, tag = "2")]
    pub one_time_pre_key_id: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct RatchetRecord {
    #[prost(bytes = "vec", tag = "1")]
    pub dh_secret: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub remote_dh_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", tag = "3")]
    pub root_key: Vec<u8>,
    #[prost(message, optional, tag = "4")]
    pub sending_chain: Option<ChainRecord>,
    #[prost(message, optional, tag = "5")]
    pub receiving_chain: Option<ChainRecord>,
    #[prost(uint32, tag = "6")]
    pub previous_sending_chain_length: u32,
    #[prost(bytes = "vec", tag = "7")]
    pub ad: Vec<u8>,
    #[prost(message, repeated, tag = "8")]
    pub skipped: Vec<SkippedKeyRecord>,
    #[prost(uint32, tag = "9")]
    pub max_skip: u32,
    #[prost(uint64, tag = "10")]
    pub skipped_capacity: u64,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct ChainRecord {
    #[prost(bytes = "vec", tag = "1")]
    pub chain_key: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub index: u32,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct SkippedKeyRecord {
    #[prost(bytes = "vec", tag = "1")]
    pub ratchet_key: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub counter: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub message_key: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub(crate) struct PreKeyBundleRecord {
    #[prost(uint32, tag = "1")]
    pub registration_id: u32,
    #[prost(uint32, tag = "2")]
    pub device_id: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub identity: Vec<u8>,
    #[prost(uint32, tag = "4")]
    pub signed_pre_key_id: u32,
    #[prost(bytes = "vec", tag = "5")]
    pub signed_pre_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "6")]
    pub signature: Vec<u8>,
    #[prost(uint32, optional, tag = "7")]
    pub one_time_pre_key_id: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "8")]
    pub one_time_pre_key: Option<Vec<u8>>,
}

fn array<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N], Error> {
    bytes
        .try_into()
        .map_err(|_| Error::Serde(format!("Invalid {what} length")))
}

fn boxed(bytes: &[u8], what: &str) -> Result<Box<[u8; 32]>, Error> {
    Ok(Box::new(array::<32>(bytes, what)?))
}

fn identity_public(bytes: &[u8]) -> Result<IdentityPublicKey, Error> {
    IdentityPublicKey::from_bytes(&array::<64>(bytes, "identity public key")?)
}

fn signature(bytes: &[u8]) -> Result<Signature, Error> {
    Signature::from_slice(bytes).map_err(|err| Error::Serde(err.to_string()))
}

fn to_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn from_secs(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn check_version(version: u32, what: &str) -> Result<(), Error> {
    if version != SCHEMA_VERSION {
        return Err(Error::Serde(format!(
            "Unsupported {what} schema version: {version}"
        )));
    }
    Ok(())
}

/// Everything needed to rebuild an [`Account`](crate::Account).
pub(crate) struct AccountParts {
    pub(crate) account_id: String,
    pub(crate) device_id: u32,
    pub(crate) registration_id: u32,
    pub(crate) identity: IdentityKey,
    pub(crate) pre_keys: PreKeyInner,
    pub(crate) trusted: Vec<(String, TrustedIdentity)>,
    pub(crate) sessions: Vec<String>,
}

pub(crate) fn encode_account(
    account_id: &str,
    device_id: u32,
    registration_id: u32,
    identity: &IdentityKey,
    pre_keys: &PreKeyStore,
    trusted: Vec<(String, TrustedIdentity)>,
    sessions: Vec<String>,
) -> Vec<u8> {
    let record = pre_keys.with_inner(|inner| AccountRecord {
        version: SCHEMA_VERSION,
        account_id: account_id.to_string(),
        device_id,
        registration_id,
        identity_key: identity.to_bytes().to_vec(),
        signed_pre_keys: inner
            .signed
            .values()
            .map(|key| SignedPreKeyRecord {
                id: key.id(),
                secret: key.key_pair().as_bytes().to_vec(),
                signature: key.signature().to_bytes().to_vec(),
                created_at: to_secs(key.created_at()),
                retired_at: inner.retired.get(&key.id()).copied().map(to_secs),
            })
            .collect(),
        current_signed_pre_key_id: inner.current_signed_id,
        next_signed_pre_key_id: inner.next_signed_id,
        one_time_pre_keys: inner
            .one_time
            .values()
            .map(|key| OneTimePreKeyRecord {
                id: key.id(),
                secret: key.key_pair().as_bytes().to_vec(),
            })
            .collect(),
        next_one_time_pre_key_id: inner.next_one_time_id,
        trusted_identities: trusted
            .into_iter()
            .map(|(user_id, trusted)| TrustedIdentityRecord {
                user_id,
                identity: trusted.identity.to_bytes().to_vec(),
                verified: trusted.verified,
            })
            .collect(),
        sessions,
    });

    record.encode_to_vec()
}

pub(crate) fn decode_account(bytes: &[u8]) -> Result<AccountParts, Error> {
    let record = AccountRecord::decode(bytes)
        .map_err(|err| Error::Serde(format!("Failed to decode account: {err:?}")))?;
    check_version(record.version, "account")?;

    let identity = IdentityKey::from(array::<64>(&record.identity_key, "identity key")?);

    let mut signed = BTreeMap::new();
    let mut retired = BTreeMap::new();
    for key in record.signed_pre_keys {
        let secret = X25519Secret::from(boxed(&key.secret, "signed pre-key")?);
        let spk = SignedPreKey::from_parts(
            key.id,
            secret,
            signature(&key.signature)?,
            from_secs(key.created_at),
        );
        if let Some(retired_at) = key.retired_at {
            retired.insert(key.id, from_secs(retired_at));
        }
        signed.insert(key.id, spk);
    }

    if !signed.contains_key(&record.current_signed_pre_key_id) {
        return Err(Error::Serde("Missing current signed pre-key".to_string()));
    }

    let mut one_time = BTreeMap::new();
    for key in record.one_time_pre_keys {
        let secret = X25519Secret::from(boxed(&key.secret, "one-time pre-key")?);
        one_time.insert(key.id, OneTimePreKey::from_parts(key.id, secret));
    }

    let trusted = record
        .trusted_identities
        .into_iter()
        .map(|entry| {
            Ok((
                entry.user_id,
                TrustedIdentity {
                    identity: identity_public(&entry.identity)?,
                    verified: entry.verified,
                },
            ))
        })
        .collect::<Result<Vec<_>, Error>>()?;

    Ok(AccountParts {
        account_id: record.account_id,
        device_id: record.device_id,
        registration_id: record.registration_id,
        identity,
        pre_keys: PreKeyInner {
            signed,
            retired,
            current_signed_id: record.current_signed_pre_key_id,
            next_signed_id: record.next_signed_pre_key_id,
            one_time,
            next_one_time_id: record.next_one_time_pre_key_id,
        },
        trusted,
        sessions: record.sessions,
    })
}

fn chain_record(chain: &Chain) -> ChainRecord {
    ChainRecord {
        chain_key: chain.chain_key.to_vec(),
        index: chain.index,
    }
}

fn chain_from_record(record: &ChainRecord) -> Result<Chain, Error> {
    Ok(Chain {
        chain_key: boxed(&record.chain_key, "chain key")?,
        index: record.index,
    })
}

fn ratchet_record(ratchet: &DoubleRatchet) -> RatchetRecord {
    let state = &ratchet.state;

    RatchetRecord {
        dh_secret: state.dh_pair.as_bytes().to_vec(),
        remote_dh_key: state.remote_dh_key_public.map(|key| key.to_bytes().to_vec()),
        root_key: state.root_key.to_vec(),
        sending_chain: state.sending_chain.as_ref().map(chain_record),
        receiving_chain: state.receiving_chain.as_ref().map(chain_record),
        previous_sending_chain_length: state.previous_sending_chain_length,
        ad: state.ad.to_vec(),
        skipped: ratchet
            .skipped
            .iter()
            .map(|(ratchet_key, counter, message_key)| SkippedKeyRecord {
                ratchet_key: ratchet_key.to_bytes().to_vec(),
                counter,
                message_key: message_key.to_vec(),
            })
            .collect(),
        max_skip: ratchet.max_skip,
        skipped_capacity: ratchet.skipped.capacity() as u64,
    }
}

fn ratchet_from_record(record: RatchetRecord) -> Result<DoubleRatchet, Error> {
    let capacity = usize::try_from(record.skipped_capacity)
        .map_err(|_| Error::Serde("Skipped key capacity out of range".to_string()))?;

    let mut skipped = SkippedKeys::new(capacity);
    for entry in &record.skipped {
        let ratchet_key = X25519PublicKey::from(array::<32>(&entry.ratchet_key, "ratchet key")?);
        skipped.insert(
            &ratchet_key,
            entry.counter,
            boxed(&entry.message_key, "skipped message key")?,
        );
    }

    let remote_dh_key_public = record
        .remote_dh_key
        .as_deref()
        .map(|bytes| array::<32>(bytes, "remote ratchet key").map(X25519PublicKey::from))
        .transpose()?;

    Ok(DoubleRatchet {
        state: RatchetState {
            dh_pair: X25519Secret::from(boxed(&record.dh_secret, "ratchet key pair")?),
            remote_dh_key_public,
            root_key: boxed(&record.root_key, "root key")?,
            sending_chain: record.sending_chain.as_ref().map(chain_from_record).transpose()?,
            receiving_chain: record
                .receiving_chain
                .as_ref()
                .map(chain_from_record)
                .transpose()?,
            previous_sending_chain_length: record.previous_sending_chain_length,
            ad: Box::new(array::<AD_LEN>(&record.ad, "associated data")?),
        },
        skipped,
        max_skip: record.max_skip,
    })
}

impl Session {
    /// Serialize the session to Protocol Buffers format.
    pub fn serialize(&self) -> Vec<u8> {
        SessionRecord {
            version: SCHEMA_VERSION,
            session_id: self.session_id.clone(),
            remote_identity: self.remote_identity.to_bytes().to_vec(),
            remote_registration_id: self.remote_registration_id,
            base_key: self.base_key.to_bytes().to_vec(),
            handshake: self.handshake.map(|handshake| HandshakeRecord {
                signed_pre_key_id: handshake.signed_pre_key_id,
                one_time_pre_key_id: handshake.one_time_pre_key_id,
            }),
            ratchet: Some(ratchet_record(&self.ratchet)),
        }
        .encode_to_vec()
    }

    /// Deserialize a session from Protocol Buffers format.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        let record = SessionRecord::decode(bytes)
            .map_err(|err| Error::Serde(format!("Failed to decode session: {err:?}")))?;
        check_version(record.version, "session")?;

        let ratchet = match record.ratchet {
            Some(ratchet) => ratchet_from_record(ratchet)?,
            None => return Err(Error::Serde("Missing ratchet data".to_string())),
        };

        Ok(Self {
            session_id: record.session_id,
            ratchet,
            remote_identity: identity_public(&record.remote_identity)?,
            remote_registration_id: record.remote_registration_id,
            base_key: X25519PublicKey::from(array::<32>(&record.base_key, "base key")?),
            handshake: record.handshake.map(|handshake| HandshakeInfo {
                signed_pre_key_id: handshake.signed_pre_key_id,
                one_time_pre_key_id: handshake.one_time_pre_key_id,
            }),
        })
    }
}

impl PreKeyBundle {
    /// Serialize the bundle for transport.
    pub fn to_bytes(&self) -> Vec<u8> {
        PreKeyBundleRecord {
            registration_id: self.registration_id,
            device_id: self.device_id,
            identity: self.identity.to_bytes().to_vec(),
            signed_pre_key_id: self.signed_pre_key_id,
            signed_pre_key: self.signed_pre_key.to_bytes().to_vec(),
            signature: self.signed_pre_key_signature.to_bytes().to_vec(),
            one_time_pre_key_id: self.one_time_pre_key.map(|(id, _)| id),
            one_time_pre_key: self.one_time_pre_key.map(|(_, key)| key.to_bytes().to_vec()),
        }
        .encode_to_vec()
    }

    /// Parse a bundle produced by [`PreKeyBundle::to_bytes`]. The signature is
    /// not checked here; call [`PreKeyBundle::verify`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let record = PreKeyBundleRecord::decode(bytes)
            .map_err(|err| Error::Serde(format!("Failed to decode bundle: {err:?}")))?;

        let one_time_pre_key = match (record.one_time_pre_key_id, record.one_time_pre_key) {
            (Some(id), Some(key)) => Some((
                id,
                X25519PublicKey::from(array::<32>(&key, "one-time pre-key")?),
            )),
            (None, None) => None,
            _ => return Err(Error::Serde("Incomplete one-time pre-key".to_string())),
        };

        Ok(Self {
            registration_id: record.registration_id,
            device_id: record.device_id,
            identity: identity_public(&record.identity)?,
            signed_pre_key_id: record.signed_pre_key_id,
            signed_pre_key: X25519PublicKey::from(array::<32>(
                &record.signed_pre_key,
                "signed pre-key",
            )?),
            signed_pre_key_signature: signature(&record.signature)?,
            one_time_pre_key,
        })
    }
}
