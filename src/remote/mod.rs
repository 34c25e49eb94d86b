//! Remote record source abstraction.
//!
//! The sync core only needs two read capabilities from the remote side:
//! listing ids page by page and fetching record bodies for a batch of ids.
//! Writes go through a separate [`RemoteRecordWriter`] so read-only sources
//! stay read-only.

mod api_types;
mod mock;
mod odoo;

pub use mock::MockSource;
pub use odoo::OdooClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

use crate::cache::{CollectionKey, Record, RecordId};

/// Failure of a single remote call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
  /// Connection-level failure (DNS, refused, reset).
  #[error("transport failure: {0}")]
  Transport(String),

  /// The call did not complete within the request timeout.
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  /// Non-success HTTP status.
  #[error("server returned {code}: {body}")]
  Status { code: u16, body: String },

  /// The response could not be decoded.
  #[error("failed to decode response: {0}")]
  Decode(String),

  /// The remote side understood the call and refused it.
  #[error("request rejected: {0}")]
  Rejected(String),
}

impl RemoteError {
  /// Whether another attempt could plausibly succeed.
  pub fn is_retryable(&self) -> bool {
    match self {
      RemoteError::Transport(_) | RemoteError::Timeout(_) => true,
      RemoteError::Status { code, .. } => *code >= 500 || *code == 408 || *code == 429,
      RemoteError::Decode(_) | RemoteError::Rejected(_) => false,
    }
  }
}

/// A named, filtered view over one remote model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
  pub key: CollectionKey,
  /// Remote model name (e.g. "res.partner")
  pub model: String,
  /// Opaque filter handed to the remote side as-is
  #[serde(default)]
  pub filter: Value,
  /// Fields requested during the detail fetch
  #[serde(default)]
  pub fields: Vec<String>,
}

impl Collection {
  pub fn new(key: impl Into<CollectionKey>, model: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      model: model.into(),
      filter: Value::Null,
      fields: Vec::new(),
    }
  }

  pub fn with_filter(mut self, filter: Value) -> Self {
    self.filter = filter;
    self
  }

  pub fn with_fields<I, S>(mut self, fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.fields = fields.into_iter().map(Into::into).collect();
    self
  }
}

/// One page of the id discovery phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdPage {
  pub ids: Vec<RecordId>,
  /// Number of ids the source consumed for this page; the next offset
  /// advances by this amount.
  pub returned_count: usize,
  /// Total matching records, when the source knows it.
  pub total: Option<usize>,
}

impl IdPage {
  pub fn new(ids: Vec<RecordId>) -> Self {
    let returned_count = ids.len();
    Self {
      ids,
      returned_count,
      total: None,
    }
  }

  pub fn with_total(mut self, total: usize) -> Self {
    self.total = Some(total);
    self
  }
}

/// A create, update or delete against one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
  Create { values: Map<String, Value> },
  Update { id: RecordId, values: Map<String, Value> },
  Delete { id: RecordId },
}

impl Mutation {
  /// Id the mutation targets, when known before it runs.
  pub fn target_id(&self) -> Option<RecordId> {
    match self {
      Mutation::Create { .. } => None,
      Mutation::Update { id, .. } | Mutation::Delete { id } => Some(*id),
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Mutation::Create { .. } => "create",
      Mutation::Update { .. } => "update",
      Mutation::Delete { .. } => "delete",
    }
  }
}

/// Read access to a remote collection. Calls must be idempotent.
#[async_trait]
pub trait RemoteRecordSource<T: Record>: Send + Sync {
  /// List up to `limit` ids matching the collection filter, starting at `offset`.
  async fn list_ids(
    &self,
    collection: &Collection,
    limit: usize,
    offset: usize,
  ) -> Result<IdPage, RemoteError>;

  /// Fetch full records for `ids`. Ids that no longer exist are simply absent.
  async fn fetch_by_ids(
    &self,
    collection: &Collection,
    ids: &[RecordId],
    fields: &[String],
  ) -> Result<Vec<T>, RemoteError>;
}

/// Write access to a remote collection.
#[async_trait]
pub trait RemoteRecordWriter: Send + Sync {
  /// Apply one mutation and return the id of the affected record.
  async fn apply(&self, collection: &Collection, mutation: &Mutation) -> Result<RecordId, RemoteError>;
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_retryable_classification() {
    assert!(RemoteError::Transport("reset".into()).is_retryable());
    assert!(RemoteError::Timeout(Duration::from_secs(1)).is_retryable());
    assert!(RemoteError::Status { code: 503, body: String::new() }.is_retryable());
    assert!(RemoteError::Status { code: 429, body: String::new() }.is_retryable());
    assert!(!RemoteError::Status { code: 401, body: String::new() }.is_retryable());
    assert!(!RemoteError::Decode("eof".into()).is_retryable());
    assert!(!RemoteError::Rejected("access denied".into()).is_retryable());
  }

  #[test]
  fn test_mutation_wire_shape() {
    let m: Mutation = serde_json::from_value(json!({"op": "update", "id": 3, "values": {"name": "x"}}))
      .unwrap();
    assert_eq!(m.target_id(), Some(3));
    assert_eq!(m.kind(), "update");

    let m: Mutation = serde_json::from_value(json!({"op": "create", "values": {}})).unwrap();
    assert_eq!(m.target_id(), None);
  }

  #[test]
  fn test_collection_from_yaml_shape() {
    let c: Collection = serde_json::from_value(json!({
      "key": "partners",
      "model": "res.partner",
      "fields": ["name", "email"]
    }))
    .unwrap();
    assert_eq!(c.key.as_str(), "partners");
    assert!(c.filter.is_null());
    assert_eq!(c.fields, vec!["name", "email"]);
  }
}
