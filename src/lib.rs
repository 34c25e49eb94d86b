//! Client-side record cache and bulk synchronization for remote
//! business-object collections.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod net;
pub mod remote;
pub mod sync;

pub use client::{RecordClient, WriteResult};
pub use error::Error;
