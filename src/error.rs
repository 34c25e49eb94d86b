use thiserror::Error;

use crate::remote::RemoteError;
use crate::sync::RetryExhausted;

/// Failures a caller of [`RecordClient`](crate::client::RecordClient) may
/// want to branch on.
#[derive(Debug, Error)]
pub enum Error {
  /// The write was refused before any remote call was made.
  #[error("write blocked: {reason}")]
  Offline { reason: String },

  #[error(transparent)]
  RetriesExhausted(#[from] RetryExhausted),

  #[error(transparent)]
  Remote(#[from] RemoteError),

  /// Local cache storage failed.
  #[error("cache storage failed: {0}")]
  Storage(String),
}

impl From<color_eyre::Report> for Error {
  fn from(report: color_eyre::Report) -> Self {
    Error::Storage(format!("{:#}", report))
  }
}
