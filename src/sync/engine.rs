//! Paginated sync engine: id discovery, batched detail fetch, coalescing.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::SyncConfig;
use super::retry::{retry_with_backoff, RetryExhausted, RetryPolicy};
use crate::cache::{CacheEnvelope, CacheStore, CollectionKey, Record, RecordId};
use crate::remote::{Collection, RemoteRecordSource};

/// Quality of a sync result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
  /// Served from a valid cached snapshot, no remote calls made
  FromCache,
  /// Every discovered record was fetched
  Full,
  /// Id discovery stopped early after exhausting retries
  PartialDiscovery,
  /// At least one detail batch was skipped after exhausting retries
  PartialFetch,
  /// Nothing usable was obtained; the cache was left untouched
  Failed,
}

impl SyncOutcome {
  pub fn is_partial(&self) -> bool {
    matches!(self, SyncOutcome::PartialDiscovery | SyncOutcome::PartialFetch)
  }
}

/// Collection-level payload persisted in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSnapshot<T> {
  /// Records in discovery order
  pub records: Vec<T>,
  /// Outcome of the sync that produced this snapshot
  pub outcome: SyncOutcome,
  /// The remote collection holds more records than the cap allowed
  pub truncated: bool,
}

/// Records plus metadata about where they came from.
#[derive(Debug, Clone)]
pub struct SyncResult<T> {
  pub records: Vec<T>,
  pub outcome: SyncOutcome,
  /// The records are known to be incomplete. For cache hits this reflects
  /// the sync that wrote the snapshot.
  pub partial: bool,
  pub truncated: bool,
  /// When the snapshot was written, if one exists
  pub stored_at: Option<DateTime<Utc>>,
}

impl<T> SyncResult<T> {
  fn from_cache(envelope: CacheEnvelope<CollectionSnapshot<T>>) -> Self {
    let stored_at = envelope.stored_at();
    let snapshot = envelope.payload;
    Self {
      partial: snapshot.outcome.is_partial(),
      records: snapshot.records,
      outcome: SyncOutcome::FromCache,
      truncated: snapshot.truncated,
      stored_at,
    }
  }

  fn failed() -> Self {
    Self {
      records: Vec::new(),
      outcome: SyncOutcome::Failed,
      partial: false,
      truncated: false,
      stored_at: None,
    }
  }

  pub fn is_failed(&self) -> bool {
    self.outcome == SyncOutcome::Failed
  }
}

/// Result of the id discovery phase.
#[derive(Debug, Default)]
struct Discovery {
  ids: Vec<RecordId>,
  /// Discovery was cut short by an exhausted page
  aborted: bool,
  truncated: bool,
}

/// Result of the detail fetch phase.
struct DetailFetch<T> {
  records: Vec<T>,
  succeeded: usize,
  skipped: usize,
}

type SharedRun<T> = Shared<BoxFuture<'static, SyncResult<T>>>;

/// Produces up-to-date snapshots of remote collections, preferring the
/// cache and tolerating partial remote failures.
///
/// At most one sync per collection key runs at a time; concurrent callers
/// for the same key (forced or not) await the run already in flight.
pub struct PaginatedSyncEngine<T: Record> {
  inner: Arc<EngineInner<T>>,
}

struct EngineInner<T: Record> {
  source: Arc<dyn RemoteRecordSource<T>>,
  cache: CacheStore,
  config: SyncConfig,
  retry: RetryPolicy,
  runs: Mutex<HashMap<CollectionKey, SharedRun<T>>>,
}

impl<T: Record> PaginatedSyncEngine<T> {
  pub fn new(
    source: Arc<dyn RemoteRecordSource<T>>,
    cache: CacheStore,
    config: SyncConfig,
    retry: RetryPolicy,
  ) -> Self {
    Self {
      inner: Arc::new(EngineInner {
        source,
        cache,
        config,
        retry,
        runs: Mutex::new(HashMap::new()),
      }),
    }
  }

  pub fn cache(&self) -> &CacheStore {
    &self.inner.cache
  }

  pub fn config(&self) -> &SyncConfig {
    &self.inner.config
  }

  pub fn retry_policy(&self) -> &RetryPolicy {
    &self.inner.retry
  }

  pub fn source(&self) -> &Arc<dyn RemoteRecordSource<T>> {
    &self.inner.source
  }

  /// Whether a sync for `collection` is currently in flight.
  pub fn is_syncing(&self, collection: &CollectionKey) -> bool {
    self.runs().contains_key(collection)
  }

  /// Wait for the sync in flight for `collection`, if there is one.
  ///
  /// Returns `true` when a run was awaited.
  pub async fn wait_for_sync(&self, collection: &CollectionKey) -> bool {
    let run = self.runs().get(collection).cloned();
    match run {
      Some(run) => {
        debug!(%collection, "waiting for sync in flight");
        run.await;
        true
      }
      None => false,
    }
  }

  /// The cached snapshot, if valid. Never touches the remote source.
  pub async fn cached(&self, collection: &CollectionKey) -> Option<SyncResult<T>> {
    self
      .inner
      .cache
      .get::<CollectionSnapshot<T>>(collection)
      .await
      .map(SyncResult::from_cache)
  }

  /// Get every record of a collection.
  ///
  /// 1. Unless forced, a valid cached snapshot is returned immediately
  /// 2. Otherwise join the sync in flight for this collection, or start one
  /// 3. A sync that produced anything is persisted, even when partial
  pub async fn get_all(&self, collection: &Collection, force_refresh: bool) -> SyncResult<T> {
    if !force_refresh {
      if let Some(hit) = self.cached(&collection.key).await {
        debug!(collection = %collection.key, records = hit.records.len(), "cache hit");
        return hit;
      }
    }

    self.join_or_start(collection).await
  }

  fn runs(&self) -> std::sync::MutexGuard<'_, HashMap<CollectionKey, SharedRun<T>>> {
    self.inner.runs()
  }

  fn join_or_start(&self, collection: &Collection) -> SharedRun<T> {
    let mut runs = self.runs();

    if let Some(run) = runs.get(&collection.key) {
      debug!(collection = %collection.key, "joining sync in flight");
      return run.clone();
    }

    let inner = Arc::clone(&self.inner);
    let collection = collection.clone();
    let key = collection.key.clone();

    let run = async move {
      let result = inner.run_sync(&collection).await;
      inner.runs().remove(&collection.key);
      result
    }
    .boxed()
    .shared();

    runs.insert(key, run.clone());
    run
  }
}

impl<T: Record> Clone for PaginatedSyncEngine<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Record> EngineInner<T> {
  fn runs(&self) -> std::sync::MutexGuard<'_, HashMap<CollectionKey, SharedRun<T>>> {
    self
      .runs
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  async fn run_sync(&self, collection: &Collection) -> SyncResult<T> {
    let started = Instant::now();
    info!(collection = %collection.key, model = %collection.model, "sync started");

    let discovery = self.discover(collection).await;
    if discovery.ids.is_empty() && discovery.aborted {
      warn!(collection = %collection.key, "sync failed: no ids discovered");
      return SyncResult::failed();
    }

    let fetch = self.fetch_details(collection, &discovery.ids).await;
    if !discovery.ids.is_empty() && fetch.succeeded == 0 {
      warn!(
        collection = %collection.key,
        batches = fetch.skipped,
        "sync failed: every detail batch was skipped"
      );
      return SyncResult::failed();
    }

    let outcome = if fetch.skipped > 0 {
      SyncOutcome::PartialFetch
    } else if discovery.aborted {
      SyncOutcome::PartialDiscovery
    } else {
      SyncOutcome::Full
    };

    let cap = self.config.max_record_cap;
    let mut records = fetch.records;
    let truncated = discovery.truncated || records.len() > cap;
    records.truncate(cap);

    let snapshot = CollectionSnapshot {
      records,
      outcome,
      truncated,
    };

    let stored_at = {
      let _guard = self.cache.lock(&collection.key).await;
      match self
        .cache
        .put(&collection.key, &snapshot, self.cache.version())
        .await
      {
        Ok(()) => DateTime::from_timestamp_millis(self.cache.now_ms()),
        Err(e) => {
          warn!(collection = %collection.key, error = %e, "failed to persist snapshot");
          None
        }
      }
    };

    info!(
      collection = %collection.key,
      records = snapshot.records.len(),
      ?outcome,
      truncated,
      elapsed_ms = started.elapsed().as_millis() as u64,
      "sync finished"
    );

    SyncResult {
      records: snapshot.records,
      outcome,
      partial: outcome.is_partial(),
      truncated,
      stored_at,
    }
  }

  /// Enumerate ids page by page, strictly in offset order.
  async fn discover(&self, collection: &Collection) -> Discovery {
    let cap = self.config.max_record_cap;
    let page_size = self.config.page_size.max(1);
    let timeout = self.config.request_timeout();

    let mut discovery = Discovery::default();
    let mut seen = HashSet::new();
    let mut offset = 0usize;
    let mut total = None;
    let mut reached_cap = false;

    loop {
      let limit = page_size.min(cap.saturating_sub(discovery.ids.len()));
      if limit == 0 {
        reached_cap = true;
        break;
      }

      let operation = format!("list_ids {} offset {}", collection.key, offset);
      let page = match retry_with_backoff(&self.retry, timeout, &operation, move || {
        self.source.list_ids(collection, limit, offset)
      })
      .await
      {
        Ok(page) => page,
        Err(e) => {
          warn!(collection = %collection.key, offset, error = %e, "id discovery aborted");
          discovery.aborted = true;
          break;
        }
      };

      if total.is_none() {
        total = page.total;
      }

      for id in page.ids {
        if discovery.ids.len() >= cap {
          break;
        }
        // Pages can shift under concurrent remote inserts
        if seen.insert(id) {
          discovery.ids.push(id);
        }
      }

      offset += page.returned_count;
      if page.returned_count < limit {
        break;
      }
      if discovery.ids.len() >= cap {
        reached_cap = true;
        break;
      }
    }

    discovery.truncated = match total {
      Some(total) => total > cap,
      None => reached_cap,
    };

    debug!(
      collection = %collection.key,
      ids = discovery.ids.len(),
      aborted = discovery.aborted,
      truncated = discovery.truncated,
      "id discovery finished"
    );
    discovery
  }

  /// Fetch record bodies batch by batch. Exhausted batches are skipped.
  async fn fetch_details(&self, collection: &Collection, ids: &[RecordId]) -> DetailFetch<T> {
    let batch_size = self.config.batch_size.max(1);
    let concurrency = self.config.max_concurrent_batches.max(1);
    let delay = self.config.inter_batch_delay();
    let timeout = self.config.request_timeout();

    let batches: Vec<_> = ids
      .chunks(batch_size)
      .enumerate()
      .map(|(index, batch)| self.fetch_batch(collection, index, batch, delay, timeout))
      .collect();

    let results: Vec<(usize, Result<Vec<T>, RetryExhausted>)> = stream::iter(batches)
      .buffer_unordered(concurrency)
      .collect()
      .await;

    // Key by id so arrival order never matters
    let mut by_id: HashMap<RecordId, T> = HashMap::new();
    let mut succeeded = 0;
    let mut skipped = 0;

    for (index, result) in results {
      match result {
        Ok(records) => {
          succeeded += 1;
          for record in records {
            by_id.insert(record.record_id(), record);
          }
        }
        Err(e) => {
          skipped += 1;
          warn!(
            collection = %collection.key,
            batch = index + 1,
            error = %e,
            "skipping detail batch"
          );
        }
      }
    }

    let records = ids.iter().filter_map(|id| by_id.remove(id)).collect();
    DetailFetch {
      records,
      succeeded,
      skipped,
    }
  }

  async fn fetch_batch(
    &self,
    collection: &Collection,
    index: usize,
    batch: &[RecordId],
    delay: Duration,
    timeout: Duration,
  ) -> (usize, Result<Vec<T>, RetryExhausted>) {
    if index > 0 && !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }

    let operation = format!("fetch_by_ids {} batch {}", collection.key, index + 1);
    let result = retry_with_backoff(&self.retry, timeout, &operation, move || {
      self.source.fetch_by_ids(collection, batch, &collection.fields)
    })
    .await;
    (index, result)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ManualClock, MemoryStorage, RemoteRecord};
  use crate::remote::MockSource;

  struct Harness {
    engine: PaginatedSyncEngine<RemoteRecord>,
    source: MockSource,
    clock: Arc<ManualClock>,
  }

  fn harness(source: MockSource, config: SyncConfig) -> Harness {
    let storage = Arc::new(MemoryStorage::new());
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let cache = CacheStore::with_clock(
      storage,
      config.cache_version.clone(),
      config.ttl(),
      clock.clone(),
    );
    let engine = PaginatedSyncEngine::new(
      Arc::new(source.clone()),
      cache,
      config,
      RetryPolicy::new(3, 100, 1_000),
    );
    Harness {
      engine,
      source,
      clock,
    }
  }

  fn config() -> SyncConfig {
    SyncConfig::default()
      .with_batch_size(100)
      .with_page_size(100)
      .with_request_timeout(Duration::from_secs(2))
  }

  fn partners() -> Collection {
    Collection::new("partners", "res.partner").with_fields(["name"])
  }

  fn ids(records: &[RemoteRecord]) -> Vec<RecordId> {
    records.iter().map(|r| r.id).collect()
  }

  #[tokio::test(start_paused = true)]
  async fn test_end_to_end_partial_fetch_then_cache() {
    let h = harness(MockSource::with_records(250), config());
    h.source.hang_fetch_containing(201);

    let result = h.engine.get_all(&partners(), true).await;
    assert_eq!(result.outcome, SyncOutcome::PartialFetch);
    assert!(result.partial);
    assert_eq!(result.records.len(), 200);
    assert_eq!(ids(&result.records), (1..=200).collect::<Vec<_>>());

    assert_eq!(h.source.list_calls(), vec![(100, 0), (100, 100), (100, 200)]);
    // Two good batches, three timed-out attempts on the third
    assert_eq!(h.source.fetch_calls().len(), 5);

    let calls = h.source.call_count();
    h.clock.advance(config().ttl_ms as i64 - 1);

    let cached = h.engine.get_all(&partners(), false).await;
    assert_eq!(cached.outcome, SyncOutcome::FromCache);
    assert!(cached.partial);
    assert_eq!(ids(&cached.records), ids(&result.records));
    assert_eq!(h.source.call_count(), calls);
  }

  #[tokio::test(start_paused = true)]
  async fn test_full_sync_then_cache_hit() {
    let h = harness(MockSource::with_records(120), config());

    let result = h.engine.get_all(&partners(), false).await;
    assert_eq!(result.outcome, SyncOutcome::Full);
    assert!(!result.partial);
    assert!(!result.truncated);
    assert_eq!(result.records.len(), 120);
    assert!(result.stored_at.is_some());

    let calls = h.source.call_count();
    let cached = h.engine.get_all(&partners(), false).await;
    assert_eq!(cached.outcome, SyncOutcome::FromCache);
    assert_eq!(cached.records, result.records);
    assert_eq!(h.source.call_count(), calls);
  }

  #[tokio::test(start_paused = true)]
  async fn test_expired_cache_resyncs() {
    let h = harness(MockSource::with_records(10), config());

    h.engine.get_all(&partners(), false).await;
    h.clock.advance(config().ttl_ms as i64);

    let result = h.engine.get_all(&partners(), false).await;
    assert_eq!(result.outcome, SyncOutcome::Full);
    assert_eq!(h.source.list_calls().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_syncs_are_coalesced() {
    let h = harness(MockSource::with_records(50), config());
    h.source.set_list_delay(Duration::from_millis(500));

    let collection = partners();
    let (a, b) = tokio::join!(
      h.engine.get_all(&collection, true),
      h.engine.get_all(&collection, true)
    );

    assert_eq!(h.source.list_calls().len(), 1);
    assert_eq!(h.source.fetch_calls().len(), 1);
    assert_eq!(a.outcome, SyncOutcome::Full);
    assert_eq!(b.outcome, SyncOutcome::Full);
    assert_eq!(a.records, b.records);
    assert!(!h.engine.is_syncing(&collection.key));

    // Once finished, a new forced call starts a new run
    h.engine.get_all(&collection, true).await;
    assert_eq!(h.source.list_calls().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_different_collections_do_not_coalesce() {
    let h = harness(MockSource::with_records(5), config());
    h.source.set_list_delay(Duration::from_millis(100));

    let partners = partners();
    let tickets = Collection::new("helpdesk_tickets", "helpdesk.ticket");
    tokio::join!(
      h.engine.get_all(&partners, true),
      h.engine.get_all(&tickets, true)
    );

    assert_eq!(h.source.list_calls().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_batch_is_skipped_and_rest_continues() {
    let h = harness(MockSource::with_records(400), config());
    h.source.always_fail_fetch_containing(150);

    let result = h.engine.get_all(&partners(), true).await;
    assert_eq!(result.outcome, SyncOutcome::PartialFetch);

    let expected: Vec<RecordId> = (1..=100).chain(201..=400).collect();
    assert_eq!(ids(&result.records), expected);

    // 1 + 3 + 1 + 1 detail calls
    assert_eq!(h.source.fetch_calls().len(), 6);

    let cached = h.engine.cached(&partners().key).await.unwrap();
    assert_eq!(ids(&cached.records), expected);
    assert!(cached.partial);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cap_enforced_with_known_total() {
    let config = config()
      .with_max_record_cap(5_000)
      .with_page_size(1_000)
      .with_batch_size(1_000);
    let h = harness(MockSource::with_records(10_000), config);
    h.source.report_total(true);

    let result = h.engine.get_all(&partners(), true).await;
    assert_eq!(result.records.len(), 5_000);
    assert!(result.truncated);
    assert_eq!(result.outcome, SyncOutcome::Full);
    assert_eq!(result.records.last().map(|r| r.id), Some(5_000));
    assert_eq!(h.source.list_calls().len(), 5);

    let cached = h.engine.cached(&partners().key).await.unwrap();
    assert_eq!(cached.records.len(), 5_000);
    assert!(cached.truncated);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cap_reached_without_total_flags_truncation() {
    let config = config().with_max_record_cap(250);
    let h = harness(MockSource::with_records(10_000), config);

    let result = h.engine.get_all(&partners(), true).await;
    assert_eq!(result.records.len(), 250);
    assert!(result.truncated);
    // The last page only asks for what is left under the cap
    assert_eq!(h.source.list_calls(), vec![(100, 0), (100, 100), (50, 200)]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_exact_fit_is_not_truncated() {
    let config = config().with_max_record_cap(300);
    let h = harness(MockSource::with_records(300), config);
    h.source.report_total(true);

    let result = h.engine.get_all(&partners(), true).await;
    assert_eq!(result.records.len(), 300);
    assert!(!result.truncated);
  }

  #[tokio::test(start_paused = true)]
  async fn test_discovery_failure_keeps_previous_cache() {
    let h = harness(MockSource::with_records(30), config());
    let first = h.engine.get_all(&partners(), true).await;
    assert_eq!(first.outcome, SyncOutcome::Full);

    h.source.always_fail_list_at(0);
    let failed = h.engine.get_all(&partners(), true).await;
    assert_eq!(failed.outcome, SyncOutcome::Failed);
    assert!(failed.is_failed());
    assert!(failed.records.is_empty());

    let cached = h.engine.get_all(&partners(), false).await;
    assert_eq!(cached.outcome, SyncOutcome::FromCache);
    assert_eq!(cached.records.len(), 30);
  }

  #[tokio::test(start_paused = true)]
  async fn test_partial_discovery_keeps_gathered_ids() {
    let h = harness(MockSource::with_records(250), config());
    h.source.always_fail_list_at(200);

    let result = h.engine.get_all(&partners(), true).await;
    assert_eq!(result.outcome, SyncOutcome::PartialDiscovery);
    assert_eq!(result.records.len(), 200);
    assert_eq!(h.source.list_calls().len(), 2 + 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_every_batch_failing_is_failed() {
    let config = config().with_batch_size(1_000);
    let h = harness(MockSource::with_records(50), config);
    h.source.always_fail_fetch_containing(1);

    let result = h.engine.get_all(&partners(), true).await;
    assert_eq!(result.outcome, SyncOutcome::Failed);
    assert!(result.records.is_empty());
    assert!(h.engine.cached(&partners().key).await.is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_empty_collection_is_full() {
    let h = harness(MockSource::new(), config());

    let result = h.engine.get_all(&partners(), true).await;
    assert_eq!(result.outcome, SyncOutcome::Full);
    assert!(result.records.is_empty());
    assert!(h.source.fetch_calls().is_empty());

    let cached = h.engine.get_all(&partners(), false).await;
    assert_eq!(cached.outcome, SyncOutcome::FromCache);
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_failures_are_absorbed() {
    let h = harness(MockSource::with_records(150), config());
    h.source.fail_list_at(100, 2);
    h.source.fail_fetch_containing(101, 1);

    let result = h.engine.get_all(&partners(), true).await;
    assert_eq!(result.outcome, SyncOutcome::Full);
    assert_eq!(result.records.len(), 150);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_batches_keep_discovery_order() {
    let config = config().with_max_concurrent_batches(4).with_batch_size(25);
    let h = harness(MockSource::with_records(200), config);
    h.source.set_fetch_delay(Duration::from_millis(10));
    h.source.fail_fetch_containing(1, 1);

    let result = h.engine.get_all(&partners(), true).await;
    assert_eq!(result.outcome, SyncOutcome::Full);
    assert_eq!(ids(&result.records), (1..=200).collect::<Vec<_>>());
  }

  #[tokio::test(start_paused = true)]
  async fn test_version_bump_forces_resync() {
    let storage = Arc::new(MemoryStorage::new());
    let clock = Arc::new(ManualClock::new(0));
    let source = MockSource::with_records(10);

    let engine_for = |version: &str| {
      let config = config().with_cache_version(version);
      let cache = CacheStore::with_clock(
        storage.clone(),
        config.cache_version.clone(),
        config.ttl(),
        clock.clone(),
      );
      PaginatedSyncEngine::new(
        Arc::new(source.clone()),
        cache,
        config,
        RetryPolicy::no_retry(),
      )
    };

    let v1 = engine_for("1");
    v1.get_all(&partners(), false).await;
    assert_eq!(
      v1.get_all(&partners(), false).await.outcome,
      SyncOutcome::FromCache
    );

    let v2 = engine_for("2");
    let result = v2.get_all(&partners(), false).await;
    assert_eq!(result.outcome, SyncOutcome::Full);
    assert_eq!(source.list_calls().len(), 2);
  }
}
