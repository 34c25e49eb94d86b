use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CollectionKey;
use crate::remote::Collection;
use crate::sync::{RetryPolicy, SyncConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub retry: RetryPolicy,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Named collections the CLI can sync, keyed by collection name
  #[serde(default)]
  pub collections: BTreeMap<String, CollectionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  pub url: String,
  pub database: String,
  #[serde(default = "default_call_path")]
  pub call_path: String,
}

fn default_call_path() -> String {
  "/api/v2/call".to_string()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
  /// Probe the API host before every write
  #[default]
  Auto,
  /// Always treat the network as reachable
  Online,
  /// Block every write
  Offline,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub mode: NetworkMode,
  pub probe_timeout_ms: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      mode: NetworkMode::Auto,
      probe_timeout_ms: 2_000,
    }
  }
}

impl NetworkConfig {
  pub fn probe_timeout(&self) -> Duration {
    Duration::from_millis(self.probe_timeout_ms)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Database file (defaults to the user data directory)
  pub path: Option<PathBuf>,
  /// Keep the cache in memory only, for throwaway runs
  pub in_memory: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionConfig {
  /// Remote model name (e.g. "res.partner")
  pub model: String,
  #[serde(default)]
  pub filter: Value,
  #[serde(default)]
  pub fields: Vec<String>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./recache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/recache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/recache/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("recache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("recache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;

    if config.sync.batch_size == 0 || config.sync.page_size == 0 {
      return Err(eyre!("sync.batch_size and sync.page_size must be positive"));
    }

    Ok(config)
  }

  /// Resolve a configured collection by name.
  ///
  /// Collections with a filter get a key derived from model and filter so
  /// differently filtered views never share a cache entry.
  pub fn collection(&self, name: &str) -> Result<Collection> {
    let entry = self.collections.get(name).ok_or_else(|| {
      eyre!(
        "Unknown collection '{}'. Configured: {}",
        name,
        self.collections.keys().cloned().collect::<Vec<_>>().join(", ")
      )
    })?;

    let key = if entry.filter.is_null() {
      CollectionKey::new(name)
    } else {
      CollectionKey::for_query(&entry.model, &entry.filter)
    };

    Ok(
      Collection::new(key, entry.model.clone())
        .with_filter(entry.filter.clone())
        .with_fields(entry.fields.iter().cloned()),
    )
  }

  /// Get the API token from environment variables.
  ///
  /// Checks RECACHE_API_TOKEN first, then ODOO_API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("RECACHE_API_TOKEN")
      .or_else(|_| std::env::var("ODOO_API_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set RECACHE_API_TOKEN or ODOO_API_TOKEN environment variable.")
      })
  }
}
