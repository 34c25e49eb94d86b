//! Versioned, TTL-aware cache store layered over a [`KeyValueStore`].

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::storage::KeyValueStore;
use super::traits::{CollectionKey, RecordId};

/// Namespace prefix shared by every key this store writes.
const NAMESPACE: &str = "c/";

/// Versioned, timestamped wrapper around a cached payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEnvelope<T> {
  pub payload: T,
  pub stored_at_epoch_ms: i64,
  pub cache_version: String,
}

impl<T> CacheEnvelope<T> {
  pub fn stored_at(&self) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(self.stored_at_epoch_ms)
  }
}

/// Location of one envelope.
#[derive(Debug, Clone, Copy)]
enum Slot<'a> {
  Collection(&'a CollectionKey),
  Record(&'a CollectionKey, RecordId),
}

impl Slot<'_> {
  fn key(&self) -> String {
    match self {
      Slot::Collection(c) => collection_key(c),
      Slot::Record(c, id) => record_key(c, *id),
    }
  }
}

/// Storage segment for a collection name. `/` separates segments, so it
/// (and `%`, the escape character) must not appear raw.
fn segment(collection: &CollectionKey) -> String {
  collection.as_str().replace('%', "%25").replace('/', "%2F")
}

fn collection_key(collection: &CollectionKey) -> String {
  format!("{}{}", NAMESPACE, segment(collection))
}

fn version_key(collection: &CollectionKey) -> String {
  format!("{}{}/v", NAMESPACE, segment(collection))
}

fn record_key(collection: &CollectionKey, id: RecordId) -> String {
  format!("{}{}/r/{}", NAMESPACE, segment(collection), id)
}

/// Durable, versioned, TTL-aware storage for collection snapshots and
/// single records.
///
/// An envelope is only ever returned when its version matches the store's
/// current version and it is younger than the TTL. Everything else
/// (missing, corrupt, mismatched, expired) reads as a miss and is evicted
/// on the spot.
///
/// Cloning is cheap; clones share storage, clock and collection locks.
#[derive(Clone)]
pub struct CacheStore {
  inner: Arc<CacheStoreInner>,
}

struct CacheStoreInner {
  storage: Arc<dyn KeyValueStore>,
  version: String,
  ttl_ms: i64,
  clock: Arc<dyn Clock>,
  locks: Mutex<HashMap<CollectionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl CacheStore {
  /// Create a cache store using the wall clock.
  pub fn new(storage: Arc<dyn KeyValueStore>, version: impl Into<String>, ttl: Duration) -> Self {
    Self::with_clock(storage, version, ttl, Arc::new(SystemClock))
  }

  /// Create a cache store with an explicit time source.
  pub fn with_clock(
    storage: Arc<dyn KeyValueStore>,
    version: impl Into<String>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      inner: Arc::new(CacheStoreInner {
        storage,
        version: version.into(),
        ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
        clock,
        locks: Mutex::new(HashMap::new()),
      }),
    }
  }

  /// The version tag envelopes must carry to be considered valid.
  pub fn version(&self) -> &str {
    &self.inner.version
  }

  pub fn now_ms(&self) -> i64 {
    self.inner.clock.now_ms()
  }

  /// Get the collection-level envelope, if present and valid.
  pub async fn get<P: DeserializeOwned>(&self, collection: &CollectionKey) -> Option<CacheEnvelope<P>> {
    self.read(Slot::Collection(collection)).await
  }

  /// Store the collection-level payload, replacing any previous envelope.
  pub async fn put<P: Serialize>(
    &self,
    collection: &CollectionKey,
    payload: &P,
    version: &str,
  ) -> Result<()> {
    self.write(Slot::Collection(collection), payload, version).await?;
    self
      .inner
      .storage
      .set(&version_key(collection), version.as_bytes().to_vec())
      .await
  }

  /// Remove the collection-level envelope and its version marker.
  pub async fn invalidate(&self, collection: &CollectionKey) -> Result<()> {
    self.inner.storage.remove(&collection_key(collection)).await?;
    self.inner.storage.remove(&version_key(collection)).await
  }

  /// Version tag of the last collection-level write, if any.
  pub async fn stored_version(&self, collection: &CollectionKey) -> Option<String> {
    match self.inner.storage.get(&version_key(collection)).await {
      Ok(bytes) => bytes.and_then(|b| String::from_utf8(b).ok()),
      Err(e) => {
        warn!(%collection, error = %e, "failed to read version marker");
        None
      }
    }
  }

  /// Get a single cached record, if present and valid.
  pub async fn get_record<R: DeserializeOwned>(
    &self,
    collection: &CollectionKey,
    id: RecordId,
  ) -> Option<R> {
    self
      .get_record_entry::<R>(collection, id)
      .await
      .map(|envelope| envelope.payload)
  }

  /// Like [`get_record`](Self::get_record), keeping the envelope metadata.
  pub async fn get_record_entry<R: DeserializeOwned>(
    &self,
    collection: &CollectionKey,
    id: RecordId,
  ) -> Option<CacheEnvelope<R>> {
    self.read(Slot::Record(collection, id)).await
  }

  /// Store a single record under the current version.
  pub async fn put_record<R: Serialize>(
    &self,
    collection: &CollectionKey,
    id: RecordId,
    record: &R,
  ) -> Result<()> {
    let version = self.inner.version.clone();
    self.write(Slot::Record(collection, id), record, &version).await
  }

  pub async fn remove_record(&self, collection: &CollectionKey, id: RecordId) -> Result<()> {
    self.inner.storage.remove(&record_key(collection, id)).await
  }

  /// Remove everything stored for one collection.
  pub async fn clear_collection(&self, collection: &CollectionKey) -> Result<()> {
    self.invalidate(collection).await?;

    // Trailing slash keeps "partners" from matching "partners_archive"
    let prefix = format!("{}{}/", NAMESPACE, segment(collection));
    self.remove_prefix(&prefix).await
  }

  /// Remove every cached collection and record.
  pub async fn clear_all(&self) -> Result<()> {
    self.remove_prefix(NAMESPACE).await
  }

  /// Acquire the write lock for one collection.
  ///
  /// Held across read-modify-write sequences so a merge never interleaves
  /// with a sync's `put` on the same collection.
  pub async fn lock(&self, collection: &CollectionKey) -> OwnedMutexGuard<()> {
    let mutex = {
      let mut locks = self
        .inner
        .locks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
      Arc::clone(locks.entry(collection.clone()).or_default())
    };
    mutex.lock_owned().await
  }

  async fn remove_prefix(&self, prefix: &str) -> Result<()> {
    let keys = self.inner.storage.list_keys_with_prefix(prefix).await?;
    debug!(prefix, count = keys.len(), "clearing cache keys");
    for key in keys {
      self.inner.storage.remove(&key).await?;
    }
    Ok(())
  }

  async fn write<P: Serialize>(&self, slot: Slot<'_>, payload: &P, version: &str) -> Result<()> {
    let envelope = CacheEnvelope {
      payload,
      stored_at_epoch_ms: self.now_ms(),
      cache_version: version.to_string(),
    };
    let bytes =
      serde_json::to_vec(&envelope).map_err(|e| eyre!("Failed to serialize envelope: {}", e))?;

    // One set call: readers see either the old envelope or the new one
    self.inner.storage.set(&slot.key(), bytes).await
  }

  async fn read<P: DeserializeOwned>(&self, slot: Slot<'_>) -> Option<CacheEnvelope<P>> {
    let key = slot.key();

    let bytes = match self.inner.storage.get(&key).await {
      Ok(Some(bytes)) => bytes,
      Ok(None) => return None,
      Err(e) => {
        warn!(key = %key, error = %e, "cache read failed, treating as miss");
        return None;
      }
    };

    let envelope: CacheEnvelope<P> = match serde_json::from_slice(&bytes) {
      Ok(envelope) => envelope,
      Err(e) => {
        warn!(key = %key, error = %e, "corrupt cache entry, discarding");
        self.evict(slot, &bytes, None).await;
        return None;
      }
    };

    if envelope.cache_version != self.inner.version {
      debug!(
        key = %key,
        stored = %envelope.cache_version,
        current = %self.inner.version,
        "cache version mismatch"
      );
      self.evict(slot, &bytes, Some(&envelope.cache_version)).await;
      return None;
    }

    let age = self.now_ms().saturating_sub(envelope.stored_at_epoch_ms);
    if age >= self.inner.ttl_ms {
      debug!(key = %key, age_ms = age, "cache entry expired");
      self.evict(slot, &bytes, None).await;
      return None;
    }

    Some(envelope)
  }

  /// Remove an entry read as `seen`, unless a writer replaced it meanwhile.
  ///
  /// Readers may run while the collection lock is held by a merge, so
  /// eviction relies on the store's compare-and-remove instead of the lock.
  /// The collection version marker is only dropped when it still names the
  /// mismatched version.
  async fn evict(&self, slot: Slot<'_>, seen: &[u8], stale_version: Option<&str>) {
    let storage = &self.inner.storage;
    let key = slot.key();

    let result = match storage.remove_if_unchanged(&key, seen).await {
      Ok(true) => match (slot, stale_version) {
        (Slot::Collection(collection), Some(version)) => storage
          .remove_if_unchanged(&version_key(collection), version.as_bytes())
          .await
          .map(|_| ()),
        _ => Ok(()),
      },
      Ok(false) => {
        debug!(key = %key, "entry replaced before eviction, keeping it");
        Ok(())
      }
      Err(e) => Err(e),
    };

    if let Err(e) = result {
      warn!(key = %key, error = %e, "failed to evict cache entry");
    }
  }
}
