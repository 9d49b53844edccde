use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the agent intercepts; everything else passes through
  pub origin: String,
  /// Deployment tag of the cache generation to install
  pub version: String,
  /// Essential resources seeded on install, in order (paths resolve against `origin`)
  #[serde(default)]
  pub manifest: Vec<String>,
  /// Document served to HTML navigations that miss the cache while offline
  pub offline_fallback: Option<String>,
  /// Where the database and logs live (defaults to the platform data dir)
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub refresh: RefreshConfig,
  #[serde(default)]
  pub probe: ProbeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  /// Bounded wait for any network attempt
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_ms: default_timeout_ms(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Remote endpoint receiving outbox records (resolves against `origin`)
  #[serde(default = "default_sync_endpoint")]
  pub endpoint: String,
  #[serde(default = "default_sync_interval")]
  pub interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      endpoint: default_sync_endpoint(),
      interval_secs: default_sync_interval(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
  #[serde(default = "default_refresh_interval")]
  pub interval_secs: u64,
}

impl Default for RefreshConfig {
  fn default() -> Self {
    Self {
      interval_secs: default_refresh_interval(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
  #[serde(default = "default_probe_interval")]
  pub interval_secs: u64,
  /// Path on the origin used to detect connectivity
  #[serde(default = "default_probe_path")]
  pub path: String,
}

impl Default for ProbeConfig {
  fn default() -> Self {
    Self {
      interval_secs: default_probe_interval(),
      path: default_probe_path(),
    }
  }
}

fn default_timeout_ms() -> u64 {
  5000
}

fn default_sync_endpoint() -> String {
  "/api/sync".to_string()
}

fn default_sync_interval() -> u64 {
  300
}

fn default_refresh_interval() -> u64 {
  3600
}

fn default_probe_interval() -> u64 {
  30
}

fn default_probe_path() -> String {
  "/".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/offsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
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

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  /// Parse and validate a YAML document.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;

    let origin = config.origin_url()?;
    if origin.cannot_be_a_base() {
      return Err(eyre!("origin must be an absolute http(s) URL"));
    }
    config.manifest_urls()?;
    config.sync_endpoint()?;

    Ok(config)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Manifest entries resolved against the origin, in declaration order.
  pub fn manifest_urls(&self) -> Result<Vec<Url>> {
    let origin = self.origin_url()?;
    self
      .manifest
      .iter()
      .map(|entry| {
        origin
          .join(entry)
          .map_err(|e| eyre!("Invalid manifest entry '{}': {}", entry, e))
      })
      .collect()
  }

  pub fn offline_fallback_url(&self) -> Result<Option<Url>> {
    let origin = self.origin_url()?;
    self
      .offline_fallback
      .as_deref()
      .map(|path| {
        origin
          .join(path)
          .map_err(|e| eyre!("Invalid offline_fallback '{}': {}", path, e))
      })
      .transpose()
  }

  pub fn sync_endpoint(&self) -> Result<Url> {
    let origin = self.origin_url()?;
    origin
      .join(&self.sync.endpoint)
      .map_err(|e| eyre!("Invalid sync endpoint '{}': {}", self.sync.endpoint, e))
  }

  pub fn probe_url(&self) -> Result<Url> {
    let origin = self.origin_url()?;
    origin
      .join(&self.probe.path)
      .map_err(|e| eyre!("Invalid probe path '{}': {}", self.probe.path, e))
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.network.timeout_ms)
  }

  /// Resolve the data directory.
  ///
  /// Checks OFFSYNC_DATA_DIR first, then the config file, then the platform data dir.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("OFFSYNC_DATA_DIR") {
      return Ok(PathBuf::from(dir));
    }
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offsync"))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("agent.db"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const MINIMAL: &str = r#"
origin: https://app.example.com
version: v1
"#;

  const FULL: &str = r#"
origin: https://app.example.com
version: "2024.06.1"
manifest:
  - /
  - /index.html
  - /static/app.js
offline_fallback: /offline.html
data_dir: /tmp/offsync-test
network:
  timeout_ms: 1500
sync:
  endpoint: /api/v2/sync
  interval_secs: 60
refresh:
  interval_secs: 600
probe:
  interval_secs: 10
  path: /health
"#;

  #[test]
  fn test_defaults() {
    let config = Config::parse(MINIMAL).unwrap();
    assert_eq!(config.version, "v1");
    assert!(config.manifest.is_empty());
    assert_eq!(config.timeout(), Duration::from_secs(5));
    assert_eq!(config.sync.interval_secs, 300);
    assert_eq!(config.refresh.interval_secs, 3600);
    assert_eq!(config.probe.interval_secs, 30);
    assert_eq!(
      config.sync_endpoint().unwrap().as_str(),
      "https://app.example.com/api/sync"
    );
    assert_eq!(config.offline_fallback_url().unwrap(), None);
    assert_eq!(config.probe_url().unwrap().as_str(), "https://app.example.com/");
  }

  #[test]
  fn test_full_config_resolves_against_origin() {
    let config = Config::parse(FULL).unwrap();

    let manifest: Vec<String> = config
      .manifest_urls()
      .unwrap()
      .into_iter()
      .map(String::from)
      .collect();
    assert_eq!(
      manifest,
      vec![
        "https://app.example.com/",
        "https://app.example.com/index.html",
        "https://app.example.com/static/app.js",
      ]
    );
    assert_eq!(
      config.sync_endpoint().unwrap().as_str(),
      "https://app.example.com/api/v2/sync"
    );
    assert_eq!(
      config.offline_fallback_url().unwrap().unwrap().as_str(),
      "https://app.example.com/offline.html"
    );
    assert_eq!(config.probe_url().unwrap().path(), "/health");
    assert_eq!(config.timeout(), Duration::from_millis(1500));
  }

  #[test]
  fn test_invalid_origin_rejected() {
    assert!(Config::parse("origin: not a url\nversion: v1\n").is_err());
    assert!(Config::parse("version: v1\n").is_err());
  }

  #[test]
  fn test_load_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offsync.yaml");
    std::fs::write(&path, FULL).unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.version, "2024.06.1");
  }
}
