//! Kind-tagged records for key-value persistence
//!
//! JSON alone cannot tell a byte buffer from a string or a list of numbers,
//! so every stored value carries a discriminator and re-hydrates to the
//! kind it was written as.

use serde::{Deserialize, Serialize};

use crate::codec::{decode, encode, Wire};
use crate::error::CodecError;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum StoredValue {
    Null,
    /// Anything else, as an encoded wire graph
    Generic(Wire),
    Bytearray(Vec<u8>),
    Memoryview(Vec<u8>),
}

impl StoredValue {
    pub fn from_value(value: &Value) -> Result<Self, CodecError> {
        Ok(match value {
            Value::Null => StoredValue::Null,
            Value::Bytes(b) => StoredValue::Bytearray(b.clone()),
            Value::View(b) => StoredValue::Memoryview(b.clone()),
            other => StoredValue::Generic(encode(other)?),
        })
    }

    pub fn into_value(self) -> Result<Value, CodecError> {
        Ok(match self {
            StoredValue::Null => Value::Null,
            StoredValue::Bytearray(b) => Value::Bytes(b),
            StoredValue::Memoryview(b) => Value::View(b),
            StoredValue::Generic(wire) => decode(&wire)?,
        })
    }

    /// The discriminator as written to disk.
    pub fn kind(&self) -> &'static str {
        match self {
            StoredValue::Null => "null",
            StoredValue::Generic(_) => "generic",
            StoredValue::Bytearray(_) => "bytearray",
            StoredValue::Memoryview(_) => "memoryview",
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
