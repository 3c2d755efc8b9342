//! Payload tree and the byte codec used for cached records.
//!
//! Remote responses arrive as loosely shaped documents. They are lifted into
//! [`Payload`], a closed tree of scalars and containers, and normalized once
//! before they are stored: calendar timestamps become epoch seconds, since
//! the stored representation has no timestamp type.

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Wall-clock format used by the remote service for naive timestamps.
const NAIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Keys whose string values the remote service sends as timestamps.
const TIMESTAMP_KEYS: &[&str] = &["created_at", "updated_at"];

#[derive(Error, Debug)]
pub enum CodecError {
  #[error("malformed payload: {0}")]
  Json(#[from] serde_json::Error),

  #[error("cannot encode non-finite number {0}")]
  NonFiniteNumber(f64),

  #[error("unexpected payload shape: expected {expected}")]
  Shape { expected: &'static str },
}

/// A structured record as exchanged with the remote service and the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Text(String),
  Timestamp(DateTime<FixedOffset>),
  List(Vec<Payload>),
  Map(BTreeMap<String, Payload>),
}

impl Payload {
  /// Lift a remote JSON document.
  ///
  /// Strings are read as timestamps only under the keys in
  /// [`TIMESTAMP_KEYS`]; all other text stays text.
  pub fn from_remote(value: Value) -> Self {
    match value {
      Value::Array(items) => Payload::List(items.into_iter().map(Payload::from_remote).collect()),
      Value::Object(map) => Payload::Map(
        map
          .into_iter()
          .map(|(k, v)| {
            let v = match v {
              Value::String(s) if TIMESTAMP_KEYS.contains(&k.as_str()) => match parse_timestamp(&s) {
                Some(ts) => Payload::Timestamp(ts),
                None => Payload::Text(s),
              },
              other => Payload::from_remote(other),
            };
            (k, v)
          })
          .collect(),
      ),
      other => Payload::from(other),
    }
  }

  pub fn get(&self, key: &str) -> Option<&Payload> {
    match self {
      Payload::Map(map) => map.get(key),
      _ => None,
    }
  }

  #[cfg(test)]
  pub fn into_list(self) -> Option<Vec<Payload>> {
    match self {
      Payload::List(items) => Some(items),
      _ => None,
    }
  }

  /// Convert to JSON. Timestamps are flattened to epoch seconds on the way.
  pub fn into_value(self) -> Result<Value, CodecError> {
    Ok(match self {
      Payload::Null => Value::Null,
      Payload::Bool(b) => Value::Bool(b),
      Payload::Int(i) => Value::Number(i.into()),
      Payload::Float(f) => Value::Number(Number::from_f64(f).ok_or(CodecError::NonFiniteNumber(f))?),
      Payload::Text(s) => Value::String(s),
      Payload::Timestamp(ts) => return Payload::Float(epoch_seconds(&ts)).into_value(),
      Payload::List(items) => Value::Array(
        items
          .into_iter()
          .map(Payload::into_value)
          .collect::<Result<_, _>>()?,
      ),
      Payload::Map(map) => Value::Object(
        map
          .into_iter()
          .map(|(k, v)| Ok((k, v.into_value()?)))
          .collect::<Result<Map<_, _>, CodecError>>()?,
      ),
    })
  }

  /// Deserialize a typed record out of this payload.
  pub fn to_record<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
    Ok(serde_json::from_value(self.clone().into_value()?)?)
  }

  /// Serialize a typed record into a payload.
  pub fn from_record<T: Serialize>(record: &T) -> Result<Self, CodecError> {
    Ok(Payload::from(serde_json::to_value(record)?))
  }
}

/// Plain conversion; strings stay text.
impl From<Value> for Payload {
  fn from(value: Value) -> Self {
    match value {
      Value::Null => Payload::Null,
      Value::Bool(b) => Payload::Bool(b),
      Value::Number(n) => match n.as_i64() {
        Some(i) => Payload::Int(i),
        None => Payload::Float(n.as_f64().unwrap_or(f64::NAN)),
      },
      Value::String(s) => Payload::Text(s),
      Value::Array(items) => Payload::List(items.into_iter().map(Payload::from).collect()),
      Value::Object(map) => Payload::Map(map.into_iter().map(|(k, v)| (k, Payload::from(v))).collect()),
    }
  }
}

/// Replace every timestamp in the tree with its epoch seconds.
pub fn normalize(payload: Payload) -> Payload {
  match payload {
    Payload::Timestamp(ts) => Payload::Float(epoch_seconds(&ts)),
    Payload::List(items) => Payload::List(items.into_iter().map(normalize).collect()),
    Payload::Map(map) => Payload::Map(map.into_iter().map(|(k, v)| (k, normalize(v))).collect()),
    scalar => scalar,
  }
}

pub fn encode(record: &Payload) -> Result<Vec<u8>, CodecError> {
  let value = normalize(record.clone()).into_value()?;
  Ok(serde_json::to_vec(&value)?)
}

pub fn decode(bytes: &[u8]) -> Result<Payload, CodecError> {
  let value: Value = serde_json::from_slice(bytes)?;
  Ok(Payload::from(value))
}

/// Whole seconds; sub-second precision and the zone identity are dropped.
fn epoch_seconds(ts: &DateTime<FixedOffset>) -> f64 {
  ts.timestamp() as f64
}

fn parse_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
  if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
    return Some(ts);
  }
  let naive = NaiveDateTime::parse_from_str(s, NAIVE_TIMESTAMP_FORMAT).ok()?;
  Local
    .from_local_datetime(&naive)
    .earliest()
    .map(|ts| ts.fixed_offset())
}
