//! Mock record source for testing.
//!
//! Holds records in memory, lets tests script failures per page or per
//! record id, and records every call for verification.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{Collection, IdPage, Mutation, RemoteError, RemoteRecordSource, RemoteRecordWriter};
use crate::cache::{RecordId, RemoteRecord};

/// Mock remote source.
///
/// Clones share state, so a test can keep one handle for assertions while
/// the engine owns another.
#[derive(Debug, Clone, Default)]
pub struct MockSource {
  inner: Arc<Mutex<MockSourceInner>>,
}

#[derive(Debug, Default)]
struct MockSourceInner {
  /// Records in discovery order
  records: Vec<RemoteRecord>,
  report_total: bool,
  /// offset -> remaining failures (usize::MAX = always)
  list_failures: HashMap<usize, usize>,
  /// id -> remaining failures for any batch containing it
  fetch_failures: HashMap<RecordId, usize>,
  /// Batches containing one of these never answer
  hanging_ids: HashSet<RecordId>,
  list_delay: Duration,
  fetch_delay: Duration,
  offline_writes: bool,
  list_calls: Vec<(usize, usize)>,
  fetch_calls: Vec<Vec<RecordId>>,
  applied: Vec<Mutation>,
}

impl MockSource {
  /// Create an empty mock source.
  pub fn new() -> Self {
    Self::default()
  }

  /// Create a source holding records with ids `1..=count`.
  pub fn with_records(count: usize) -> Self {
    let source = Self::new();
    {
      let mut inner = source.lock();
      inner.records = (1..=count as RecordId)
        .map(|id| RemoteRecord::new(id).with_field("name", format!("Record {}", id)))
        .collect();
    }
    source
  }

  fn lock(&self) -> MutexGuard<'_, MockSourceInner> {
    self
      .inner
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Report the total record count on every id page.
  pub fn report_total(&self, enabled: bool) {
    self.lock().report_total = enabled;
  }

  /// Replace or append a record.
  pub fn upsert(&self, record: RemoteRecord) {
    let mut inner = self.lock();
    match inner.records.iter_mut().find(|r| r.id == record.id) {
      Some(existing) => *existing = record,
      None => inner.records.push(record),
    }
  }

  /// Fail the next `times` listings at `offset`.
  pub fn fail_list_at(&self, offset: usize, times: usize) {
    self.lock().list_failures.insert(offset, times);
  }

  /// Fail every listing at `offset`.
  pub fn always_fail_list_at(&self, offset: usize) {
    self.fail_list_at(offset, usize::MAX);
  }

  /// Fail the next `times` detail fetches whose batch contains `id`.
  pub fn fail_fetch_containing(&self, id: RecordId, times: usize) {
    self.lock().fetch_failures.insert(id, times);
  }

  /// Fail every detail fetch whose batch contains `id`.
  pub fn always_fail_fetch_containing(&self, id: RecordId) {
    self.fail_fetch_containing(id, usize::MAX);
  }

  /// Never answer detail fetches whose batch contains `id`.
  pub fn hang_fetch_containing(&self, id: RecordId) {
    self.lock().hanging_ids.insert(id);
  }

  pub fn set_list_delay(&self, delay: Duration) {
    self.lock().list_delay = delay;
  }

  pub fn set_fetch_delay(&self, delay: Duration) {
    self.lock().fetch_delay = delay;
  }

  /// Make every write fail with a transport error.
  pub fn fail_writes(&self, enabled: bool) {
    self.lock().offline_writes = enabled;
  }

  /// `(limit, offset)` of every listing call, in call order.
  pub fn list_calls(&self) -> Vec<(usize, usize)> {
    self.lock().list_calls.clone()
  }

  /// Id batches of every detail fetch call, in call order.
  pub fn fetch_calls(&self) -> Vec<Vec<RecordId>> {
    self.lock().fetch_calls.clone()
  }

  /// Every mutation that reached the source.
  pub fn applied(&self) -> Vec<Mutation> {
    self.lock().applied.clone()
  }

  /// Total remote calls of any kind.
  pub fn call_count(&self) -> usize {
    let inner = self.lock();
    inner.list_calls.len() + inner.fetch_calls.len() + inner.applied.len()
  }

  pub fn records(&self) -> Vec<RemoteRecord> {
    self.lock().records.clone()
  }
}

/// Consume one scripted failure, if any is left.
fn take_failure(remaining: Option<&mut usize>) -> bool {
  match remaining {
    Some(n) if *n == usize::MAX => true,
    Some(n) if *n > 0 => {
      *n -= 1;
      true
    }
    _ => false,
  }
}

#[async_trait]
impl RemoteRecordSource<RemoteRecord> for MockSource {
  async fn list_ids(
    &self,
    _collection: &Collection,
    limit: usize,
    offset: usize,
  ) -> Result<IdPage, RemoteError> {
    let delay = {
      let mut inner = self.lock();
      inner.list_calls.push((limit, offset));
      inner.list_delay
    };
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }

    let mut inner = self.lock();
    if take_failure(inner.list_failures.get_mut(&offset)) {
      return Err(RemoteError::Transport(format!("listing failed at offset {}", offset)));
    }

    let ids: Vec<RecordId> = inner
      .records
      .iter()
      .skip(offset)
      .take(limit)
      .map(|r| r.id)
      .collect();

    let page = IdPage::new(ids);
    Ok(if inner.report_total {
      page.with_total(inner.records.len())
    } else {
      page
    })
  }

  async fn fetch_by_ids(
    &self,
    _collection: &Collection,
    ids: &[RecordId],
    _fields: &[String],
  ) -> Result<Vec<RemoteRecord>, RemoteError> {
    let (delay, hang) = {
      let mut inner = self.lock();
      inner.fetch_calls.push(ids.to_vec());
      let hang = ids.iter().any(|id| inner.hanging_ids.contains(id));
      (inner.fetch_delay, hang)
    };
    if hang {
      std::future::pending::<()>().await;
    }
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }

    let mut inner = self.lock();
    for id in ids {
      if take_failure(inner.fetch_failures.get_mut(id)) {
        return Err(RemoteError::Transport(format!("batch containing {} failed", id)));
      }
    }

    let wanted: HashSet<RecordId> = ids.iter().copied().collect();
    Ok(
      inner
        .records
        .iter()
        .filter(|r| wanted.contains(&r.id))
        .cloned()
        .collect(),
    )
  }
}

#[async_trait]
impl RemoteRecordWriter for MockSource {
  async fn apply(&self, _collection: &Collection, mutation: &Mutation) -> Result<RecordId, RemoteError> {
    let mut inner = self.lock();
    inner.applied.push(mutation.clone());

    if inner.offline_writes {
      return Err(RemoteError::Transport("connection refused".to_string()));
    }

    match mutation {
      Mutation::Create { values } => {
        let id = inner.records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        let mut record = RemoteRecord::new(id);
        record.fields = values.clone();
        inner.records.push(record);
        Ok(id)
      }
      Mutation::Update { id, values } => {
        let record = inner
          .records
          .iter_mut()
          .find(|r| r.id == *id)
          .ok_or_else(|| RemoteError::Rejected(format!("record {} does not exist", id)))?;
        for (k, v) in values {
          record.fields.insert(k.clone(), v.clone());
        }
        Ok(*id)
      }
      Mutation::Delete { id } => {
        let before = inner.records.len();
        inner.records.retain(|r| r.id != *id);
        if inner.records.len() == before {
          return Err(RemoteError::Rejected(format!("record {} does not exist", id)));
        }
        Ok(*id)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn partners() -> Collection {
    Collection::new("partners", "res.partner")
  }

  #[tokio::test]
  async fn test_pages_and_short_last_page() {
    let source = MockSource::with_records(250);

    let page = source.list_ids(&partners(), 100, 200).await.unwrap();
    assert_eq!(page.returned_count, 50);
    assert_eq!(page.ids.first(), Some(&201));
    assert_eq!(page.total, None);

    source.report_total(true);
    let page = source.list_ids(&partners(), 100, 0).await.unwrap();
    assert_eq!(page.total, Some(250));
    assert_eq!(source.list_calls(), vec![(100, 200), (100, 0)]);
  }

  #[tokio::test]
  async fn test_scripted_fetch_failures() {
    let source = MockSource::with_records(10);
    source.fail_fetch_containing(3, 1);

    assert!(source.fetch_by_ids(&partners(), &[1, 2, 3], &[]).await.is_err());
    let records = source.fetch_by_ids(&partners(), &[1, 2, 3], &[]).await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[2].field("name"), Some(&json!("Record 3")));
  }

  #[tokio::test]
  async fn test_apply_mutations() {
    let source = MockSource::with_records(2);
    let mut values = serde_json::Map::new();
    values.insert("name".into(), json!("New"));

    let id = source
      .apply(&partners(), &Mutation::Create { values: values.clone() })
      .await
      .unwrap();
    assert_eq!(id, 3);

    let err = source
      .apply(&partners(), &Mutation::Delete { id: 99 })
      .await
      .unwrap_err();
    assert!(matches!(err, RemoteError::Rejected(_)));
    assert_eq!(source.applied().len(), 2);
  }
}
