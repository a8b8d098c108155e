//! AMF value types
//!
//! The subset of AMF0 values that actually appears in RTMP command and
//! data messages. Keys are always strings in AMF.

use std::collections::HashMap;

/// An AMF0 value
#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    /// Null value (marker 0x05)
    Null,

    /// Undefined value (marker 0x06)
    Undefined,

    /// Boolean (marker 0x01)
    Boolean(bool),

    /// IEEE 754 double (marker 0x00); AMF0 has no integer type
    Number(f64),

    /// UTF-8 string (marker 0x02, or 0x0C for long strings)
    String(String),

    /// Dense array (marker 0x0A)
    Array(Vec<AmfValue>),

    /// Key-value object (marker 0x03)
    Object(HashMap<String, AmfValue>),

    /// Associative array (marker 0x08), what `onMetaData` usually is
    EcmaArray(HashMap<String, AmfValue>),
}

impl AmfValue {
    /// Try to get this value as a string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Try to get this value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmfValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get this value as an object reference
    ///
    /// ECMA arrays are treated as objects; encoders use the two
    /// interchangeably for property bags.
    pub fn as_object(&self) -> Option<&HashMap<String, AmfValue>> {
        match self {
            AmfValue::Object(m) => Some(m),
            AmfValue::EcmaArray(m) => Some(m),
            _ => None,
        }
    }

    /// Check if this value is null or undefined
    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, AmfValue::Null | AmfValue::Undefined)
    }

    /// Look up a string property on an object-like value
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.as_object()?.get(key)?.as_str()
    }

    /// Look up a numeric property on an object-like value
    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.as_object()?.get(key)?.as_number()
    }
}

impl From<&str> for AmfValue {
    fn from(s: &str) -> Self {
        AmfValue::String(s.to_string())
    }
}

impl From<String> for AmfValue {
    fn from(s: String) -> Self {
        AmfValue::String(s)
    }
}

impl From<f64> for AmfValue {
    fn from(n: f64) -> Self {
        AmfValue::Number(n)
    }
}

impl From<bool> for AmfValue {
    fn from(b: bool) -> Self {
        AmfValue::Boolean(b)
    }
}

/// Build an [`AmfValue::Object`] from key-value pairs
pub fn object<const N: usize>(pairs: [(&str, AmfValue); N]) -> AmfValue {
    AmfValue::Object(
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}
