//! Record client with transparent caching, sync and gated writes.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, CollectionKey, KeyValueStore, Record, RecordId, RemoteRecord, SqliteStorage};
use crate::config::{Config, NetworkMode};
use crate::error::Error;
use crate::net::{NetworkStatusProbe, OfflineGate, StaticProbe, TcpProbe, Writability};
use crate::remote::{Collection, Mutation, OdooClient, RemoteError, RemoteRecordSource, RemoteRecordWriter};
use crate::sync::{
  retry_with_backoff, CollectionSnapshot, PaginatedSyncEngine, RetryPolicy, SingleRecordMerger, SyncConfig,
  SyncResult,
};

/// Outcome of a successful remote write.
#[derive(Debug, Clone)]
pub struct WriteResult<T> {
  /// Id of the created, updated or deleted record
  pub id: RecordId,
  /// The authoritative record as re-read after the write; `None` for
  /// deletes, or when the re-read failed and the collection was invalidated
  pub record: Option<T>,
  /// Whether a cached collection snapshot was updated
  pub merged: bool,
}

/// Client with transparent caching support.
///
/// Reads go through the sync engine and the per-record cache. Writes are
/// gated on connectivity, sent once, and the authoritative record is merged
/// back into the cache.
pub struct RecordClient<T: Record> {
  engine: PaginatedSyncEngine<T>,
  merger: SingleRecordMerger<T>,
  gate: OfflineGate,
  writer: Arc<dyn RemoteRecordWriter>,
}

impl<T: Record> Clone for RecordClient<T> {
  fn clone(&self) -> Self {
    Self {
      engine: self.engine.clone(),
      merger: self.merger.clone(),
      gate: self.gate.clone(),
      writer: Arc::clone(&self.writer),
    }
  }
}

impl RecordClient<RemoteRecord> {
  /// Build a client against the configured Odoo server and on-disk cache.
  pub fn from_config(config: &Config) -> Result<Self> {
    let remote = Arc::new(OdooClient::new(config)?);

    let storage: Arc<dyn KeyValueStore> = match &config.cache.path {
      _ if config.cache.in_memory => Arc::new(SqliteStorage::open_in_memory()?),
      Some(path) => Arc::new(SqliteStorage::open_at(path)?),
      None => Arc::new(SqliteStorage::open()?),
    };
    let cache = CacheStore::new(storage, config.sync.cache_version.clone(), config.sync.ttl());

    let probe: Arc<dyn NetworkStatusProbe> = match (config.network.mode, remote.server_address()) {
      (NetworkMode::Online, _) | (NetworkMode::Auto, None) => Arc::new(StaticProbe::online()),
      (NetworkMode::Offline, _) => Arc::new(StaticProbe::offline()),
      (NetworkMode::Auto, Some(addr)) => Arc::new(TcpProbe::new(addr, config.network.probe_timeout())),
    };

    Ok(Self::new(
      remote.clone(),
      remote,
      cache,
      OfflineGate::new(probe),
      config.sync.clone(),
      config.retry,
    ))
  }
}

impl<T: Record> RecordClient<T> {
  pub fn new(
    source: Arc<dyn RemoteRecordSource<T>>,
    writer: Arc<dyn RemoteRecordWriter>,
    cache: CacheStore,
    gate: OfflineGate,
    config: SyncConfig,
    retry: RetryPolicy,
  ) -> Self {
    let merger = SingleRecordMerger::new(cache.clone(), config.max_record_cap);
    let engine = PaginatedSyncEngine::new(source, cache, config, retry);
    Self {
      engine,
      merger,
      gate,
      writer,
    }
  }

  pub fn engine(&self) -> &PaginatedSyncEngine<T> {
    &self.engine
  }

  fn cache(&self) -> &CacheStore {
    self.engine.cache()
  }

  /// Get every record of a collection, from cache when valid.
  pub async fn get_all(&self, collection: &Collection, force_refresh: bool) -> SyncResult<T> {
    self.engine.get_all(collection, force_refresh).await
  }

  /// Get one record by id.
  ///
  /// Serves the newest cached copy from the per-record cache or the
  /// collection snapshot, else asks the remote side. A remote hit is cached
  /// and merged into the snapshot. `Ok(None)` means the remote side does not know the id.
  pub async fn get_one(
    &self,
    collection: &Collection,
    id: RecordId,
    force_refresh: bool,
  ) -> Result<Option<T>, Error> {
    if !force_refresh {
      if let Some(record) = self.cached_one(&collection.key, id).await {
        return Ok(Some(record));
      }
    }

    match self.fetch_one(collection, id).await? {
      Some(record) => {
        self.remember(&collection.key, &record).await?;
        Ok(Some(record))
      }
      None => {
        self.cache().remove_record(&collection.key, id).await?;
        Ok(None)
      }
    }
  }

  /// Apply a mutation on the remote side and fold the result into the cache.
  ///
  /// The write is attempted once. If the follow-up read of the written
  /// record fails, the collection snapshot is invalidated so the next read
  /// resyncs.
  pub async fn write(&self, collection: &Collection, mutation: Mutation) -> Result<WriteResult<T>, Error> {
    if let Writability::Blocked { reason } = self.gate.check_writable().await {
      warn!(collection = %collection.key, op = mutation.kind(), %reason, "write blocked");
      return Err(Error::Offline { reason });
    }

    let timeout = self.engine.config().request_timeout();
    let id = tokio::time::timeout(timeout, self.writer.apply(collection, &mutation))
      .await
      .map_err(|_| RemoteError::Timeout(timeout))??;

    info!(collection = %collection.key, op = mutation.kind(), id, "remote write applied");

    // A run that started before the write may still hold pre-write records;
    // let it land first so the merge below is not overwritten
    self.engine.wait_for_sync(&collection.key).await;

    if let Mutation::Delete { .. } = mutation {
      let merged = self.merger.remove(&collection.key, id).await?;
      self.cache().remove_record(&collection.key, id).await?;
      return Ok(WriteResult {
        id,
        record: None,
        merged,
      });
    }

    match self.fetch_one(collection, id).await {
      Ok(Some(record)) => {
        let merged = self.remember(&collection.key, &record).await?;
        Ok(WriteResult {
          id,
          record: Some(record),
          merged,
        })
      }
      outcome => {
        if let Err(e) = &outcome {
          warn!(collection = %collection.key, id, error = %e, "re-read after write failed");
        }
        self.cache().invalidate(&collection.key).await?;
        self.cache().remove_record(&collection.key, id).await?;
        Ok(WriteResult {
          id,
          record: None,
          merged: false,
        })
      }
    }
  }

  /// Drop everything cached for one collection.
  pub async fn clear_collection(&self, collection: &CollectionKey) -> Result<(), Error> {
    info!(%collection, "clearing collection cache");
    self.cache().clear_collection(collection).await?;
    Ok(())
  }

  /// Drop every cached collection and record.
  pub async fn clear_all(&self) -> Result<(), Error> {
    info!("clearing all caches");
    self.cache().clear_all().await?;
    Ok(())
  }

  /// Newest cached copy of one record.
  ///
  /// Both the per-record entry and the collection snapshot may hold the
  /// record; the later write wins and the snapshot wins ties.
  async fn cached_one(&self, collection: &CollectionKey, id: RecordId) -> Option<T> {
    let entry = self.cache().get_record_entry::<T>(collection, id).await;
    let in_snapshot = self
      .cache()
      .get::<CollectionSnapshot<T>>(collection)
      .await
      .and_then(|envelope| {
        let stored_at = envelope.stored_at_epoch_ms;
        envelope
          .payload
          .records
          .into_iter()
          .find(|r| r.record_id() == id)
          .map(|record| (stored_at, record))
      });

    match (entry, in_snapshot) {
      (Some(entry), Some((stored_at, _))) if entry.stored_at_epoch_ms > stored_at => {
        debug!(%collection, id, "record cache hit");
        Some(entry.payload)
      }
      (_, Some((_, record))) => {
        debug!(%collection, id, "record found in snapshot");
        Some(record)
      }
      (Some(entry), None) => {
        debug!(%collection, id, "record cache hit");
        Some(entry.payload)
      }
      (None, None) => None,
    }
  }

  async fn fetch_one(&self, collection: &Collection, id: RecordId) -> Result<Option<T>, Error> {
    let source = self.engine.source();
    let timeout = self.engine.config().request_timeout();
    let operation = format!("fetch_by_ids {} id {}", collection.key, id);

    let records = retry_with_backoff(self.engine.retry_policy(), timeout, &operation, || {
      source.fetch_by_ids(collection, std::slice::from_ref(&id), &collection.fields)
    })
    .await?;

    Ok(records.into_iter().find(|r| r.record_id() == id))
  }

  /// Store a record individually and merge it into the snapshot.
  async fn remember(&self, collection: &CollectionKey, record: &T) -> Result<bool, Error> {
    self.cache().put_record(collection, record.record_id(), record).await?;
    Ok(self.merger.merge(collection, record).await?)
  }
}
