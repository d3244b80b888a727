//! Structural query keys and namespace prefixes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Errors raised when building a key from arbitrary JSON.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
  #[error("query key must be a JSON array, got {0}")]
  NotAnArray(String),
  #[error("query key parts cannot be floating point numbers: {0}")]
  Float(String),
  #[error("query key integer out of range: {0}")]
  IntOutOfRange(String),
}

/// One segment of a [`QueryKey`].
///
/// Maps keep their fields sorted, so `{"a":1,"b":2}` and `{"b":2,"a":1}` are the
/// same part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum KeyPart {
  Null,
  Bool(bool),
  Int(i64),
  Str(String),
  List(Vec<KeyPart>),
  Map(BTreeMap<String, KeyPart>),
}

impl KeyPart {
  /// Build a map part from field/value pairs.
  pub fn map<I, K, V>(fields: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<KeyPart>,
  {
    KeyPart::Map(
      fields
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    )
  }

  /// Look up a field when this part is a map.
  pub fn field(&self, name: &str) -> Option<&KeyPart> {
    match self {
      KeyPart::Map(fields) => fields.get(name),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      KeyPart::Str(s) => Some(s),
      _ => None,
    }
  }
}

impl TryFrom<Value> for KeyPart {
  type Error = KeyError;

  fn try_from(value: Value) -> Result<Self, Self::Error> {
    Ok(match value {
      Value::Null => KeyPart::Null,
      Value::Bool(b) => KeyPart::Bool(b),
      Value::Number(n) => match n.as_i64() {
        Some(i) => KeyPart::Int(i),
        None if n.is_u64() => return Err(KeyError::IntOutOfRange(n.to_string())),
        None => return Err(KeyError::Float(n.to_string())),
      },
      Value::String(s) => KeyPart::Str(s),
      Value::Array(items) => KeyPart::List(
        items
          .into_iter()
          .map(KeyPart::try_from)
          .collect::<Result<_, _>>()?,
      ),
      Value::Object(fields) => KeyPart::Map(
        fields
          .into_iter()
          .map(|(k, v)| Ok((k, KeyPart::try_from(v)?)))
          .collect::<Result<_, KeyError>>()?,
      ),
    })
  }
}

impl From<KeyPart> for Value {
  fn from(part: KeyPart) -> Self {
    match part {
      KeyPart::Null => Value::Null,
      KeyPart::Bool(b) => Value::Bool(b),
      KeyPart::Int(i) => Value::from(i),
      KeyPart::Str(s) => Value::String(s),
      KeyPart::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
      KeyPart::Map(fields) => Value::Object(
        fields
          .into_iter()
          .map(|(k, v)| (k, Value::from(v)))
          .collect(),
      ),
    }
  }
}

impl From<&str> for KeyPart {
  fn from(s: &str) -> Self {
    KeyPart::Str(s.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(s: String) -> Self {
    KeyPart::Str(s)
  }
}

impl From<i64> for KeyPart {
  fn from(i: i64) -> Self {
    KeyPart::Int(i)
  }
}

impl From<i32> for KeyPart {
  fn from(i: i32) -> Self {
    KeyPart::Int(i64::from(i))
  }
}

impl From<u32> for KeyPart {
  fn from(i: u32) -> Self {
    KeyPart::Int(i64::from(i))
  }
}

impl From<bool> for KeyPart {
  fn from(b: bool) -> Self {
    KeyPart::Bool(b)
  }
}

/// Hierarchical cache key, e.g. `["todos", {"filter": "all"}]`.
///
/// Keys compare structurally. A key is inside the namespace of every one of its
/// prefixes, so invalidating `["todos"]` reaches `["todos", {"page": 1}]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
  /// Start a key with its root segment.
  pub fn new(root: impl Into<KeyPart>) -> Self {
    Self(vec![root.into()])
  }

  /// Append a segment.
  pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
    self.0.push(part.into());
    self
  }

  /// Parse a key from a JSON array such as `["todos", {"page": 1}]`.
  pub fn from_json(value: Value) -> Result<Self, KeyError> {
    match value {
      Value::Array(items) => Ok(Self(
        items
          .into_iter()
          .map(KeyPart::try_from)
          .collect::<Result<_, _>>()?,
      )),
      other => Err(KeyError::NotAnArray(other.to_string())),
    }
  }

  pub fn to_json(&self) -> Value {
    Value::Array(self.0.iter().cloned().map(Value::from).collect())
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// True when `prefix` is this key or one of its ancestors.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// True when either key lies in the other's namespace.
  pub fn is_related(&self, other: &QueryKey) -> bool {
    self.starts_with(other) || other.starts_with(self)
  }

  /// True when this key lies under any of the given prefixes.
  pub fn is_under_any(&self, prefixes: &[QueryKey]) -> bool {
    prefixes.iter().any(|p| self.starts_with(p))
  }

  /// Stable fixed-length identifier used as a storage key.
  pub fn storage_hash(&self) -> String {
    // serde_json objects are ordered, so the rendering is canonical
    let mut hasher = Sha256::new();
    hasher.update(self.to_json().to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_json())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_structural_equality_ignores_field_order() {
    let a = QueryKey::from_json(json!(["todos", {"page": 1, "filter": "all"}])).unwrap();
    let b = QueryKey::new("todos").with(KeyPart::map([("filter", KeyPart::from("all")), ("page", KeyPart::from(1i64))]));
    assert_eq!(a, b);
    assert_eq!(a.storage_hash(), b.storage_hash());
  }

  #[test]
  fn test_prefix_matching() {
    let root = QueryKey::new("todos");
    let page = QueryKey::from_json(json!(["todos", {"page": 1}])).unwrap();
    let other = QueryKey::new("todo-count");

    assert!(page.starts_with(&root));
    assert!(root.starts_with(&root));
    assert!(!root.starts_with(&page));
    assert!(!other.starts_with(&root));
    assert!(root.is_related(&page));
    assert!(page.is_related(&root));
    assert!(!other.is_related(&root));
  }

  #[test]
  fn test_rejects_floats_and_non_arrays() {
    assert_eq!(
      QueryKey::from_json(json!(["price", 1.5])),
      Err(KeyError::Float("1.5".to_string()))
    );
    assert_eq!(
      QueryKey::from_json(json!(["block", u64::MAX])),
      Err(KeyError::IntOutOfRange(u64::MAX.to_string()))
    );
    assert!(matches!(
      QueryKey::from_json(json!({"todos": true})),
      Err(KeyError::NotAnArray(_))
    ));
  }

  #[test]
  fn test_serde_uses_plain_json_array() {
    let key = QueryKey::new("game").with(7i64).with("players");
    let text = serde_json::to_string(&key).unwrap();
    assert_eq!(text, r#"["game",7,"players"]"#);
    let back: QueryKey = serde_json::from_str(&text).unwrap();
    assert_eq!(back, key);
  }
}
