//! Value Codec
//!
//! JSON encoding for values crossing into L2/L3. L1 keeps values native.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Encode a value for an L2/L3 backend
pub fn encode_value<V: Serialize>(value: &V) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Decode bytes read from an L2/L3 backend
pub fn decode_value<V: DeserializeOwned>(raw: &[u8]) -> Result<V> {
    Ok(serde_json::from_slice(raw)?)
}
