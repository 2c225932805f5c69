use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Canonically encode a value.
///
/// Argument tuples are encoded with this before fingerprinting, so equal
/// arguments always yield equal bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serialize(value)?)
}

/// Decode a value produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(bincode::deserialize(bytes)?)
}

/// What the cache holds for a fingerprint.
///
/// Failed calls are cached as well so that their error resurfaces the next
/// time the fingerprint is looked up instead of being recomputed forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    /// The encoded return value.
    Value(Vec<u8>),
    /// The failure message of the call.
    Failure(String),
}

impl Record {
    /// Encode the record for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        encode(self)
    }

    /// Decode a stored record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        decode(bytes)
    }
}
