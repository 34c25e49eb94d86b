//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identity of a remote record, unique within a collection.
pub type RecordId = i64;

/// Trait for records that can be mirrored locally.
///
/// Implementors must expose the remote id so that batches, merges and
/// per-record cache entries can be keyed without knowing the record shape.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Remote identity of this record
  fn record_id(&self) -> RecordId;
}

/// Name of a cached collection (e.g. "partners", "helpdesk_tickets").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionKey(String);

impl CollectionKey {
  pub fn new(key: impl Into<String>) -> Self {
    Self(key.into())
  }

  /// Derive a stable key from a model name and a filter.
  ///
  /// Two views over the same model with different filters get different
  /// keys, so they never overwrite each other's snapshot.
  pub fn for_query(model: &str, filter: &serde_json::Value) -> Self {
    let input = format!("{}:{}", model, normalize_filter(filter));

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hex::encode(hasher.finalize());

    Self(format!("{}-{}", model.replace('.', "_"), &digest[..12]))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CollectionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for CollectionKey {
  fn from(s: &str) -> Self {
    Self::new(s)
  }
}

impl From<String> for CollectionKey {
  fn from(s: String) -> Self {
    Self(s)
  }
}

/// Normalize a filter for consistent hashing.
/// serde_json keeps object keys sorted, so re-serializing is enough.
fn normalize_filter(filter: &serde_json::Value) -> String {
  if filter.is_null() {
    return String::new();
  }
  filter.to_string()
}

/// Generic remote record: an id plus whatever fields were requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
  pub id: RecordId,
  #[serde(flatten)]
  pub fields: serde_json::Map<String, serde_json::Value>,
}

impl RemoteRecord {
  pub fn new(id: RecordId) -> Self {
    Self {
      id,
      fields: serde_json::Map::new(),
    }
  }

  /// Builder-style field setter, mostly useful in tests.
  pub fn with_field(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
    self.fields.insert(name.to_string(), value.into());
    self
  }

  pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
    self.fields.get(name)
  }
}

impl Record for RemoteRecord {
  fn record_id(&self) -> RecordId {
    self.id
  }
}
