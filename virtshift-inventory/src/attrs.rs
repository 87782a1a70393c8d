//! Attribute values as stored in the inventory.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single inventory attribute value.
///
/// The inventory is schemaless from this crate's point of view; values are
/// one of a small set of scalar types. Variant order matters for untagged
/// deserialization: integers must be tried before floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl AttributeValue {
    /// Integer view, accepting whole floats as well.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(n) => Some(*n),
            AttributeValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// Numeric view.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(n) => Some(*n as f64),
            AttributeValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Int(n) => write!(f, "{}", n),
            AttributeValue::Float(x) => write!(f, "{}", x),
            AttributeValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Str(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Str(value)
    }
}

/// The attribute bag of one inventory record.
pub type AttributeMap = BTreeMap<String, AttributeValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_roundtrip_keeps_integers() {
        let parsed: AttributeValue = serde_json::from_str("2048").unwrap();
        assert_eq!(parsed, AttributeValue::Int(2048));
        assert_eq!(parsed.as_int(), Some(2048));

        let parsed: AttributeValue = serde_json::from_str("0.95").unwrap();
        assert_eq!(parsed, AttributeValue::Float(0.95));
    }

    #[test]
    fn display_is_bare() {
        assert_eq!(AttributeValue::from("kvm").to_string(), "kvm");
        assert_eq!(AttributeValue::Int(6).to_string(), "6");
    }
}
