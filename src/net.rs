//! Connectivity probing and the write gate built on top of it.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Answers whether the remote side is currently reachable.
#[async_trait]
pub trait NetworkStatusProbe: Send + Sync {
  async fn is_connected(&self) -> bool;
}

/// Probe that opens a TCP connection to the API host.
#[derive(Debug, Clone)]
pub struct TcpProbe {
  addr: String,
  timeout: Duration,
}

impl TcpProbe {
  /// `addr` is `host:port`.
  pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
    Self {
      addr: addr.into(),
      timeout,
    }
  }
}

#[async_trait]
impl NetworkStatusProbe for TcpProbe {
  async fn is_connected(&self) -> bool {
    match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
      Ok(Ok(_)) => true,
      Ok(Err(e)) => {
        debug!(addr = %self.addr, error = %e, "connectivity probe failed");
        false
      }
      Err(_) => {
        debug!(addr = %self.addr, "connectivity probe timed out");
        false
      }
    }
  }
}

/// Probe with a fixed, togglable answer.
#[derive(Debug)]
pub struct StaticProbe(AtomicBool);

impl StaticProbe {
  pub fn online() -> Self {
    Self(AtomicBool::new(true))
  }

  pub fn offline() -> Self {
    Self(AtomicBool::new(false))
  }

  pub fn set(&self, connected: bool) {
    self.0.store(connected, Ordering::SeqCst);
  }
}

#[async_trait]
impl NetworkStatusProbe for StaticProbe {
  async fn is_connected(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// Verdict of [`OfflineGate::check_writable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Writability {
  Allowed,
  Blocked { reason: String },
}

impl Writability {
  pub fn is_allowed(&self) -> bool {
    matches!(self, Writability::Allowed)
  }
}

/// Decides whether a mutating operation may proceed. Reads never consult it.
#[derive(Clone)]
pub struct OfflineGate {
  probe: Arc<dyn NetworkStatusProbe>,
}

impl OfflineGate {
  pub fn new(probe: Arc<dyn NetworkStatusProbe>) -> Self {
    Self { probe }
  }

  pub async fn check_writable(&self) -> Writability {
    if self.probe.is_connected().await {
      Writability::Allowed
    } else {
      Writability::Blocked {
        reason: "offline".to_string(),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn test_gate_follows_probe() {
    let probe = Arc::new(StaticProbe::online());
    let gate = OfflineGate::new(probe.clone());
    assert_eq!(gate.check_writable().await, Writability::Allowed);

    probe.set(false);
    assert_eq!(
      gate.check_writable().await,
      Writability::Blocked {
        reason: "offline".to_string()
      }
    );
  }

  #[tokio::test]
  async fn test_tcp_probe_reaches_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let probe = TcpProbe::new(addr, Duration::from_secs(1));
    assert!(probe.is_connected().await);
  }

  #[tokio::test]
  async fn test_tcp_probe_refused() {
    // Bind then drop to get a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let probe = TcpProbe::new(addr, Duration::from_secs(1));
    assert!(!probe.is_connected().await);
  }
}
