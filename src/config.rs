use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub server: ServerConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Origin of the remote system of record (e.g. "https://billing.example.com")
  pub base_url: String,
  /// Path drafts are POSTed to
  pub sync_endpoint: String,
  pub login_path: String,
  /// Page served when both network and cache fail
  pub offline_path: String,
  /// Main record-listing view, reloaded after a successful sync
  pub listing_path: String,
  /// Dedicated offline-drafts view
  pub drafts_path: String,
  pub api_prefix: String,
  /// Dynamic-cache entries dropped when the session expires
  pub auth_purge_paths: Vec<String>,
  /// Record-management and configuration sections, always network-first
  pub record_sections: Vec<String>,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      base_url: "http://127.0.0.1:8000".to_string(),
      sync_endpoint: "/api/offline/invoices".to_string(),
      login_path: "/login".to_string(),
      offline_path: "/offline".to_string(),
      listing_path: "/invoices".to_string(),
      drafts_path: "/invoices/offline".to_string(),
      api_prefix: "/api".to_string(),
      auth_purge_paths: vec!["/dashboard".to_string(), "/invoices".to_string()],
      record_sections: vec!["/invoices".to_string(), "/settings".to_string()],
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Queue database location (default: $XDG_DATA_HOME/offsync/queue.db)
  pub path: Option<PathBuf>,
  /// Stop retrying a draft after this many failed attempts (default: never)
  pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Settle time after coming online before a drain starts
  pub debounce_ms: u64,
  /// How often `watch` probes the server for reachability
  pub probe_interval_secs: u64,
  /// Tag that identifies the offline-sync background trigger
  pub background_tag: String,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      debounce_ms: 800,
      probe_interval_secs: 5,
      background_tag: crate::sync::BACKGROUND_SYNC_TAG.to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Version tag both cache generations are derived from
  pub version: String,
  /// Cache database location (default: $XDG_DATA_HOME/offsync/cache.db)
  pub path: Option<PathBuf>,
  /// App shell assets fetched on install
  pub shell_assets: Vec<String>,
  /// Document-type assets always served cache-first (full paths or bare file names)
  pub documents: Vec<String>,
  /// File extensions that are never cached
  pub excluded_extensions: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "v4".to_string(),
      path: None,
      shell_assets: [
        "/",
        "/dashboard",
        "/invoices",
        "/invoices/offline",
        "/offline",
        "/static/manifest.json",
        "/static/style.css",
        "/static/pwa/icon-192.png",
        "/static/pwa/icon-512.png",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      documents: ["/static/manifest.json", "manifest.json", "style.css"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
      excluded_extensions: vec!["pdf".to_string()],
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
  ///
  /// Falls back to defaults when no file is found. `OFFSYNC_SERVER_URL`
  /// overrides `server.base_url` either way.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(url) = std::env::var("OFFSYNC_SERVER_URL") {
      config.server.base_url = url;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Root directory for databases and logs.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offsync"))
  }

  pub fn queue_path(&self) -> Result<PathBuf> {
    match &self.queue.path {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("queue.db")),
    }
  }

  pub fn cache_path(&self) -> Result<PathBuf> {
    match &self.cache.path {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("cache.db")),
    }
  }

  /// Absolute URL for a server-relative path.
  pub fn server_url(&self, path: &str) -> Result<url::Url> {
    let base = url::Url::parse(&self.server.base_url)
      .map_err(|e| eyre!("Invalid server URL {}: {}", self.server.base_url, e))?;
    base
      .join(path)
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_when_sections_missing() {
    let config = Config::from_yaml("server:\n  base_url: https://example.com\n").unwrap();
    assert_eq!(config.server.base_url, "https://example.com");
    assert_eq!(config.server.login_path, "/login");
    assert_eq!(config.sync.debounce_ms, 800);
    assert_eq!(config.cache.version, "v4");
    assert!(config.queue.max_attempts.is_none());
  }

  #[test]
  fn test_partial_section_keeps_other_defaults() {
    let yaml = "sync:\n  debounce_ms: 1500\ncache:\n  version: v9\n";
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.sync.debounce_ms, 1500);
    assert_eq!(config.sync.background_tag, "sync-offline-records");
    assert_eq!(config.cache.version, "v9");
    assert_eq!(config.cache.excluded_extensions, vec!["pdf".to_string()]);
  }

  #[test]
  fn test_server_url_joins_path() {
    let config = Config::default();
    let url = config.server_url("/api/offline/invoices").unwrap();
    assert_eq!(url.as_str(), "http://127.0.0.1:8000/api/offline/invoices");
  }

  #[test]
  fn test_explicit_missing_path_errors() {
    let result = Config::load(Some(Path::new("/nonexistent/offsync.yaml")));
    assert!(result.is_err());
  }
}
