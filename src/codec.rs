//! Value <-> text conversion shared by the cache, list and pub/sub helpers
//!
//! Values are stored as JSON text. Counters never pass through here: they are
//! native integers on the store side.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Any JSON-representable value (object, array, string, number, bool, null)
pub type StoreValue = serde_json::Value;

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String, CodecError> {
  serde_json::to_string(value).map_err(CodecError::Serialization)
}

pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
  serde_json::from_str(text).map_err(CodecError::Deserialization)
}

/// Encode every value of a batch, failing on the first one that cannot be encoded
pub fn encode_all<T: Serialize>(values: &[T]) -> Result<Vec<String>, CodecError> {
  values.iter().map(|v| encode(v)).collect()
}
