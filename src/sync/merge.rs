//! Single-record upserts and removals against a cached collection snapshot.

use color_eyre::Result;
use std::marker::PhantomData;
use tracing::debug;

use super::engine::CollectionSnapshot;
use crate::cache::{CacheStore, CollectionKey, Record, RecordId};

/// Folds single-record changes into a cached collection snapshot without a
/// full resync.
pub struct SingleRecordMerger<T: Record> {
  cache: CacheStore,
  max_record_cap: usize,
  _record: PhantomData<fn() -> T>,
}

impl<T: Record> Clone for SingleRecordMerger<T> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      max_record_cap: self.max_record_cap,
      _record: PhantomData,
    }
  }
}

impl<T: Record> SingleRecordMerger<T> {
  pub fn new(cache: CacheStore, max_record_cap: usize) -> Self {
    Self {
      cache,
      max_record_cap,
      _record: PhantomData,
    }
  }

  /// Replace the record with the same id in place, or append it.
  ///
  /// Returns `false` when there is no valid snapshot to merge into; a later
  /// sync will pick the record up. Merging the same record twice leaves the
  /// snapshot unchanged apart from its timestamp.
  pub async fn merge(&self, collection: &CollectionKey, record: &T) -> Result<bool> {
    let _guard = self.cache.lock(collection).await;

    let Some(mut snapshot) = self.snapshot(collection).await else {
      debug!(%collection, id = record.record_id(), "no snapshot to merge into");
      return Ok(false);
    };

    let id = record.record_id();
    let len = snapshot.records.len();
    match snapshot.records.iter_mut().find(|r| r.record_id() == id) {
      Some(existing) => *existing = record.clone(),
      None if len < self.max_record_cap => snapshot.records.push(record.clone()),
      None => {
        debug!(%collection, id, cap = self.max_record_cap, "snapshot at cap, record not appended");
        snapshot.truncated = true;
      }
    }

    self.store(collection, &snapshot).await?;
    Ok(true)
  }

  /// Drop a record from the snapshot. Returns `false` when there is no
  /// valid snapshot.
  pub async fn remove(&self, collection: &CollectionKey, id: RecordId) -> Result<bool> {
    let _guard = self.cache.lock(collection).await;

    let Some(mut snapshot) = self.snapshot(collection).await else {
      return Ok(false);
    };

    snapshot.records.retain(|r| r.record_id() != id);
    self.store(collection, &snapshot).await?;
    Ok(true)
  }

  async fn snapshot(&self, collection: &CollectionKey) -> Option<CollectionSnapshot<T>> {
    self
      .cache
      .get::<CollectionSnapshot<T>>(collection)
      .await
      .map(|envelope| envelope.payload)
  }

  async fn store(&self, collection: &CollectionKey, snapshot: &CollectionSnapshot<T>) -> Result<()> {
    self
      .cache
      .put(collection, snapshot, self.cache.version())
      .await
  }
}
