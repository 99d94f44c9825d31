use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};

// ---------------------------------------------------------------------------
// RawRecord — the wire-in byte map produced by sources
// ---------------------------------------------------------------------------

/// One raw message as yielded by a source: the payload bytes plus an
/// optional origin identity. Mutable only during construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub msg: Vec<u8>,
    pub from: Option<Vec<u8>>,
}

impl RawRecord {
    pub fn new(msg: Vec<u8>) -> Self {
        Self { msg, from: None }
    }

    pub fn with_from(msg: Vec<u8>, from: Vec<u8>) -> Self {
        Self {
            msg,
            from: Some(from),
        }
    }
}

// ---------------------------------------------------------------------------
// Value — heterogeneous field value
// ---------------------------------------------------------------------------

/// A single field of a [`Record`].
///
/// The sink serializes values to JSON: timestamps as RFC 3339 strings,
/// bytes as lossy UTF-8.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Time(DateTime<Utc>),
    Map(BTreeMap<String, Value>),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Time(t)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(m: BTreeMap<String, Value>) -> Self {
        Value::Map(m)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Str(s) => serializer.serialize_str(s),
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::Float(n) => serializer.serialize_f64(*n),
            Value::Time(t) => serializer.serialize_str(&t.to_rfc3339()),
            Value::Map(m) => {
                let mut map = serializer.serialize_map(Some(m.len()))?;
                for (k, v) in m {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::Bytes(b) => serializer.serialize_str(&String::from_utf8_lossy(b)),
        }
    }
}

// ---------------------------------------------------------------------------
// Record — the structured record flowing parser → filters → sink
// ---------------------------------------------------------------------------

/// String-keyed heterogeneous map. Created by the parser, enriched by
/// filters, consumed by the sink. Owned by exactly one stage at a time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The value under `key` if it is a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn record_insert_and_typed_get() {
        let mut rec = Record::new();
        rec.insert("tag", "sshd");
        rec.insert("count", 3_i64);
        assert_eq!(rec.get_str("tag"), Some("sshd"));
        assert_eq!(rec.get_str("count"), None);
        assert_eq!(rec.get("count"), Some(&Value::Int(3)));
        assert!(rec.get("missing").is_none());
    }

    #[test]
    fn serialize_to_json() {
        let mut rec = Record::new();
        rec.insert("msg", "hello");
        rec.insert("bytes_in", 42_i64);
        rec.insert("ratio", 0.5_f64);
        rec.insert(
            "timestamp",
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        );
        let mut loc = BTreeMap::new();
        loc.insert("lat".to_string(), Value::Float(31.0));
        rec.insert("geo", loc);

        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["msg"], "hello");
        assert_eq!(json["bytes_in"], 42);
        assert_eq!(json["ratio"], 0.5);
        assert_eq!(json["timestamp"], "2024-03-01T12:00:00+00:00");
        assert_eq!(json["geo"]["lat"], 31.0);
    }

    #[test]
    fn bytes_serialize_lossy() {
        let mut rec = Record::new();
        rec.insert("raw", Value::Bytes(b"abc\xff".to_vec()));
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("abc"));
    }
}
