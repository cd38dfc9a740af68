//! Record and value model.
//!
//! A [`RawRecord`] is what the host adapter decodes from the collector's
//! flush payload: timestamps plus a field tree whose map keys may themselves
//! be byte strings. [`normalize`] converts that tree into the routed form
//! (string keys only, byte strings rendered as text) which the rest of the
//! pipeline operates on.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};

/// A field value as decoded from the host, before normalization.
///
/// Map keys are arbitrary values at this stage; anything that is not a
/// (byte) string is discarded during normalization.
#[derive(Clone, Debug, PartialEq)]
pub enum RawValue {
    /// A byte string; may or may not be valid UTF-8.
    Bytes(Vec<u8>),
    /// A signed integer.
    Integer(i64),
    /// A floating point number.
    Float(f64),
    /// A boolean.
    Boolean(bool),
    /// A nested mapping with arbitrary keys.
    Map(Vec<(RawValue, RawValue)>),
    /// An ordered sequence.
    Array(Vec<RawValue>),
    /// An explicit null.
    Null,
}

impl RawValue {
    /// Convenience constructor for a UTF-8 string value.
    pub fn string(value: impl AsRef<str>) -> Self {
        RawValue::Bytes(value.as_ref().as_bytes().to_vec())
    }
}

/// One inbound log observation, pre-normalization.
#[derive(Clone, Debug)]
pub struct RawRecord {
    /// Moment of observation.
    pub timestamp: DateTime<Utc>,
    /// Decoded field tree; keys may be non-strings and are filtered during
    /// normalization.
    pub fields: Vec<(RawValue, RawValue)>,
}

/// A normalized field value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Text. Byte strings are rendered lossily into this variant.
    Text(String),
    /// A signed integer.
    Integer(i64),
    /// A floating point number.
    Float(f64),
    /// A boolean.
    Boolean(bool),
    /// A nested, string-keyed mapping.
    Map(BTreeMap<String, Value>),
    /// An ordered sequence.
    Array(Vec<Value>),
    /// An explicit null.
    Null,
}

/// The normalized field tree of a record.
pub type Fields = BTreeMap<String, Value>;

/// A normalized record as handed to the router pipeline.
#[derive(Clone, Debug)]
pub struct Record {
    /// Moment of observation.
    pub timestamp: DateTime<Utc>,
    /// String-keyed field tree.
    pub fields: Fields,
}

/// Converts a raw record into its normalized form.
///
/// Byte-string values become text (lossy UTF-8); entries whose key is not a
/// byte string are dropped, recursively.
pub fn normalize(raw: RawRecord) -> Record {
    Record {
        timestamp: raw.timestamp,
        fields: normalize_entries(raw.fields),
    }
}

fn normalize_entries(entries: Vec<(RawValue, RawValue)>) -> Fields {
    let mut fields = BTreeMap::new();
    for (key, value) in entries {
        let RawValue::Bytes(key) = key else { continue };
        let key = String::from_utf8_lossy(&key).into_owned();
        fields.insert(key, normalize_value(value));
    }
    fields
}

fn normalize_value(value: RawValue) -> Value {
    match value {
        RawValue::Bytes(bytes) => Value::Text(String::from_utf8_lossy(&bytes).into_owned()),
        RawValue::Integer(v) => Value::Integer(v),
        RawValue::Float(v) => Value::Float(v),
        RawValue::Boolean(v) => Value::Boolean(v),
        RawValue::Map(entries) => Value::Map(normalize_entries(entries)),
        RawValue::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        RawValue::Null => Value::Null,
    }
}

impl Value {
    /// Returns the text content when this value is textual.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the nested map when this value is a mapping.
    pub fn as_map(&self) -> Option<&Fields> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Whether this value is a scalar (not a map or array).
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::Map(_) | Value::Array(_))
    }
}

/// Catch-all rendering used by the logfmt line format and single-key lines.
///
/// Scalars render bare; maps and arrays fall back to their JSON form, the
/// closest analogue to a printf `%v` of a nested structure.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => f.write_str(s),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Null => f.write_str("null"),
            Value::Map(_) | Value::Array(_) => {
                let rendered =
                    serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&rendered)
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Text(s) => serializer.serialize_str(s),
            Value::Integer(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Boolean(v) => serializer.serialize_bool(*v),
            Value::Null => serializer.serialize_unit(),
            Value::Map(map) => {
                let mut state = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    state.serialize_entry(key, value)?;
                }
                state.end()
            }
            Value::Array(items) => {
                let mut state = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    state.serialize_element(item)?;
                }
                state.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from(json))
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(v) => Value::Boolean(v),
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Value::Integer(v)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::Text(String::from_utf8_lossy(&value).into_owned())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

/// Looks up a nested field by path segments.
pub fn field_at<'a>(fields: &'a Fields, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let value = fields.get(*first)?;
    if rest.is_empty() {
        Some(value)
    } else {
        field_at(value.as_map()?, rest)
    }
}
