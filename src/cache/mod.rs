//! Generic caching layer for data persistence and offline reads.
//!
//! This module provides a record-agnostic caching mechanism that:
//! - Stores opaque blobs in a pluggable key/value backend (SQLite by default)
//! - Wraps payloads in versioned, timestamped envelopes
//! - Treats missing, corrupt, version-mismatched and expired entries alike,
//!   as a miss, evicting them lazily on read
//! - Caches whole collection snapshots and, optionally, single records

mod clock;
mod storage;
mod store;
mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use storage::{KeyValueStore, MemoryStorage, SqliteStorage};
pub use store::{CacheEnvelope, CacheStore};
pub use traits::{CollectionKey, Record, RecordId, RemoteRecord};
