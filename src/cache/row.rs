//! Storable scalar values and the row layout of a cache entry

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single storable field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StorableValue {
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl StorableValue {
    /// Name of the variant, used in corruption reports
    pub fn kind(&self) -> &'static str {
        match self {
            StorableValue::Bool(_) => "bool",
            StorableValue::Integer(_) => "integer",
            StorableValue::Real(_) => "real",
            StorableValue::Text(_) => "text",
            StorableValue::Blob(_) => "blob",
        }
    }
}

impl From<bool> for StorableValue {
    fn from(value: bool) -> Self {
        StorableValue::Bool(value)
    }
}

impl From<i64> for StorableValue {
    fn from(value: i64) -> Self {
        StorableValue::Integer(value)
    }
}

impl From<f64> for StorableValue {
    fn from(value: f64) -> Self {
        StorableValue::Real(value)
    }
}

impl From<String> for StorableValue {
    fn from(value: String) -> Self {
        StorableValue::Text(value)
    }
}

impl From<&str> for StorableValue {
    fn from(value: &str) -> Self {
        StorableValue::Text(value.to_string())
    }
}

impl From<Vec<u8>> for StorableValue {
    fn from(value: Vec<u8>) -> Self {
        StorableValue::Blob(value)
    }
}

/// Field name to value mapping persisted for one entry
pub type Row = BTreeMap<String, StorableValue>;
