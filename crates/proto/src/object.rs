use std::fmt;

use codec::CodecError;
use crypto::CryptManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inventory::InventoryVector;
use crate::topology::StreamId;

const NONCE_LEN: usize = 8;

/// Longest lifetime an object may declare, in seconds.
pub const MAX_OBJECT_TTL: i64 = 28 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("object of {0} bytes is shorter than its nonce")]
    Truncated(usize),
    #[error("malformed object body: {0}")]
    Codec(#[from] CodecError),
}

/// What an object carries. Only `Msg` objects are opened locally; every
/// kind is stored and relayed the same way.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    GetPubKey,
    PubKey,
    Msg,
    Broadcast,
    Other(u32),
}

#[derive(Serialize)]
struct BodyRef<'a> {
    expires: i64,
    kind: ObjectKind,
    stream: StreamId,
    #[serde(with = "serde_bytes")]
    payload: &'a [u8],
}

#[derive(Deserialize)]
struct Body {
    expires: i64,
    kind: ObjectKind,
    stream: StreamId,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

/// An object before its proof of work is attached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectTemplate {
    pub expires: i64,
    pub kind: ObjectKind,
    pub stream: StreamId,
    pub payload: Vec<u8>,
}

impl ObjectTemplate {
    /// Bytes covered by the proof of work.
    pub fn pow_payload(&self) -> Result<Vec<u8>, ObjectError> {
        Ok(codec::to_vec(&BodyRef {
            expires: self.expires,
            kind: self.kind,
            stream: self.stream,
            payload: &self.payload,
        })?)
    }

    /// Attaches `nonce` and freezes the object.
    pub fn seal(self, nonce: u64) -> Result<ObjectRecord, ObjectError> {
        let body = self.pow_payload()?;
        let mut bytes = Vec::with_capacity(NONCE_LEN + body.len());
        bytes.extend_from_slice(&nonce.to_be_bytes());
        bytes.extend_from_slice(&body);
        Ok(ObjectRecord {
            nonce,
            expires: self.expires,
            kind: self.kind,
            stream: self.stream,
            payload: self.payload,
            inventory: InventoryVector::of(&bytes),
            bytes,
        })
    }
}

/// A sealed object: nonce, header and opaque payload.
///
/// The serialized bytes are kept verbatim so the inventory vector and the
/// proof of work are always computed over exactly what was received.
#[derive(Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    nonce: u64,
    expires: i64,
    kind: ObjectKind,
    stream: StreamId,
    payload: Vec<u8>,
    inventory: InventoryVector,
    bytes: Vec<u8>,
}

impl ObjectRecord {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ObjectError> {
        if bytes.len() < NONCE_LEN {
            return Err(ObjectError::Truncated(bytes.len()));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[..NONCE_LEN]);
        let body: Body = codec::from_slice(&bytes[NONCE_LEN..])?;
        Ok(Self {
            nonce: u64::from_be_bytes(nonce),
            expires: body.expires,
            kind: body.kind,
            stream: body.stream,
            payload: body.payload,
            inventory: InventoryVector::of(&bytes),
            bytes,
        })
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn expires(&self) -> i64 {
        self.expires
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn inventory(&self) -> InventoryVector {
        self.inventory
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Bytes covered by the proof of work.
    pub fn pow_payload(&self) -> &[u8] {
        &self.bytes[NONCE_LEN..]
    }

    pub fn has_valid_pow(&self, crypt: &dyn CryptManager) -> bool {
        crypt.check_pow(self.pow_payload(), self.nonce)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires < now
    }

    /// Whether the declared expiry lies further ahead than any object may live.
    pub fn exceeds_ttl(&self, now: i64, grace: i64) -> bool {
        self.expires > now.saturating_add(MAX_OBJECT_TTL).saturating_add(grace)
    }
}

impl fmt::Debug for ObjectRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRecord")
            .field("inventory", &self.inventory)
            .field("kind", &self.kind)
            .field("stream", &self.stream)
            .field("expires", &self.expires)
            .field("len", &self.bytes.len())
            .finish()
    }
}
