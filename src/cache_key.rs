//! Canonical cache keys.
//!
//! A [`CacheKey`] is the string identity of a request payload. Two payloads
//! that serialize to the same JSON value (ignoring object key order) share a
//! key; `1` and `"1"` never do. Plain strings key as themselves so item ids
//! such as `"users||1"` stay readable in state dumps and logs.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

/// Prefix marking every non-string key. Strings that start with it are
/// escaped by doubling it.
const SENTINEL: char = '§';

/// Object keys are sorted down to this nesting depth; deeper values are
/// written as `serde_json` renders them.
const MAX_SORT_DEPTH: usize = 6;

/// Canonical identity of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
  /// Derive the key of any serializable payload.
  ///
  /// Fields skipped by serde (e.g. `skip_serializing_if = "Option::is_none"`)
  /// do not take part in the key, so `{a: 1}` and `{a: 1, b: <skipped>}` key
  /// identically.
  pub fn of<P: Serialize + ?Sized>(payload: &P) -> Self {
    match serde_json::to_value(payload) {
      Ok(value) => Self::from_value(&value),
      Err(err) => {
        warn!(
          error = %err,
          payload_type = std::any::type_name::<P>(),
          "Payload is not representable as JSON, keying by type name"
        );
        Self(format!("{SENTINEL}!{}", std::any::type_name::<P>()).into())
      }
    }
  }

  /// Derive the key of an already-built JSON value.
  pub fn from_value(value: &Value) -> Self {
    let key = match value {
      Value::String(s) if s.starts_with(SENTINEL) => format!("{SENTINEL}{s}"),
      Value::String(s) => s.clone(),
      Value::Number(n) => format!("{SENTINEL}n{n}"),
      Value::Bool(b) => format!("{SENTINEL}{b}"),
      Value::Null => format!("{SENTINEL}null"),
      structured => {
        let mut out = String::new();
        out.push(SENTINEL);
        write_canonical(&mut out, structured, 0);
        out
      }
    };
    Self(key.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Short, fixed-length digest used to identify keys in logs.
  pub fn fingerprint(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.0.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..6])
  }
}

fn write_canonical(out: &mut String, value: &Value, depth: usize) {
  match value {
    Value::Object(map) if depth < MAX_SORT_DEPTH => {
      let mut entries: Vec<_> = map.iter().collect();
      entries.sort_by(|a, b| a.0.cmp(b.0));

      out.push('{');
      for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(out, value, depth + 1);
      }
      out.push('}');
    }
    Value::Array(values) => {
      out.push('[');
      for (i, value) in values.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(out, value, depth + 1);
      }
      out.push(']');
    }
    other => out.push_str(&other.to_string()),
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for CacheKey {
  fn from(value: &str) -> Self {
    Self::of(value)
  }
}

impl From<String> for CacheKey {
  fn from(value: String) -> Self {
    Self::of(&value)
  }
}

impl Serialize for CacheKey {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.0)
  }
}
