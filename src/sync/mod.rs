//! Bulk synchronization of remote collections into the cache.

mod config;
mod engine;
mod merge;
mod retry;

pub use config::SyncConfig;
pub use engine::{CollectionSnapshot, PaginatedSyncEngine, SyncOutcome, SyncResult};
pub use merge::SingleRecordMerger;
pub use retry::{retry_with_backoff, RetryExhausted, RetryPolicy};
