//! Configuration for the sync engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Version tag stamped on every envelope; bump it to invalidate all caches.
  pub cache_version: String,
  /// Staleness horizon.
  pub ttl_ms: u64,
  /// Records per detail-fetch call.
  pub batch_size: usize,
  /// Ids requested per discovery page.
  pub page_size: usize,
  /// Detail batches allowed in flight at once.
  pub max_concurrent_batches: usize,
  /// Hard upper bound on records mirrored locally.
  pub max_record_cap: usize,
  /// Per-call timeout.
  pub request_timeout_ms: u64,
  /// Pause between detail batches.
  pub inter_batch_delay_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      cache_version: "1".to_string(),
      ttl_ms: 15 * 60 * 1000,
      batch_size: 100,
      page_size: 100,
      max_concurrent_batches: 1,
      max_record_cap: 5_000,
      request_timeout_ms: 10_000,
      inter_batch_delay_ms: 100,
    }
  }
}

impl SyncConfig {
  pub fn ttl(&self) -> Duration {
    Duration::from_millis(self.ttl_ms)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.request_timeout_ms)
  }

  pub fn inter_batch_delay(&self) -> Duration {
    Duration::from_millis(self.inter_batch_delay_ms)
  }

  pub fn with_cache_version(mut self, version: impl Into<String>) -> Self {
    self.cache_version = version.into();
    self
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl_ms = ttl.as_millis() as u64;
    self
  }

  pub fn with_batch_size(mut self, size: usize) -> Self {
    self.batch_size = size;
    self
  }

  pub fn with_page_size(mut self, size: usize) -> Self {
    self.page_size = size;
    self
  }

  pub fn with_max_concurrent_batches(mut self, n: usize) -> Self {
    self.max_concurrent_batches = n;
    self
  }

  pub fn with_max_record_cap(mut self, cap: usize) -> Self {
    self.max_record_cap = cap;
    self
  }

  pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
    self.request_timeout_ms = timeout.as_millis() as u64;
    self
  }

  pub fn with_inter_batch_delay(mut self, delay: Duration) -> Self {
    self.inter_batch_delay_ms = delay.as_millis() as u64;
    self
  }
}
