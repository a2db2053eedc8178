//! Canonical serialization helpers.
//!
//! Objects, message plaintexts and wire frames are all encoded as CBOR. This
//! crate wraps `ciborium` so that encoding choices and error mapping stay in a
//! single place.

use ciborium::de::from_reader;
use ciborium::ser::into_writer;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
}

/// Serialize a value into CBOR bytes.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    into_writer(value, &mut buf).map_err(|err| CodecError::Encode(err.to_string()))?;
    Ok(buf)
}

/// Deserialize a value that must occupy all of `bytes`.
pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let mut reader = bytes;
    let value = from_reader(&mut reader).map_err(|err| CodecError::Decode(err.to_string()))?;
    if !reader.is_empty() {
        return Err(CodecError::TrailingBytes(reader.len()));
    }
    Ok(value)
}
