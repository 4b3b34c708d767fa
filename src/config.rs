use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::{Origin, Url};

use crate::push::NotificationDefaults;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Deployed version tag; changing it is the only upgrade signal
  pub version: String,
  /// Location the worker is served from; manifest paths resolve against it
  pub base_url: String,
  pub partitions: PartitionsConfig,
  /// Relative paths fetched during install
  pub precache_manifest: Vec<String>,
  /// Origin of the remote data API (network-first)
  pub remote_api_origin: Option<String>,
  /// Host serving immutable library assets (cache-first)
  pub cdn_host: Option<String>,
  /// Path suffixes treated as documents
  pub document_suffixes: Vec<String>,
  /// Page served when a document is requested offline and not cached
  pub fallback_document: String,
  /// Signal readiness to activate as soon as install succeeds
  pub skip_waiting_on_install: bool,
  /// SQLite file holding the partitions (defaults to the user data dir)
  pub database: Option<PathBuf>,
  pub notification: NotificationDefaults,
}

/// Base names for the three partition roles; the version tag is appended.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PartitionsConfig {
  pub precache: String,
  pub runtime: String,
  pub remote_api: String,
}

impl Default for PartitionsConfig {
  fn default() -> Self {
    Self {
      precache: "shell-cache".to_string(),
      runtime: "shell-runtime".to_string(),
      remote_api: "shell-api".to_string(),
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      version: "1".to_string(),
      base_url: "http://localhost:8080/".to_string(),
      partitions: PartitionsConfig::default(),
      precache_manifest: vec![
        "./index.html".to_string(),
        "./manifest.json".to_string(),
        "./icons/icon-192x192.png".to_string(),
        "./icons/icon-512x512.png".to_string(),
      ],
      remote_api_origin: None,
      cdn_host: Some("cdn.jsdelivr.net".to_string()),
      document_suffixes: vec![".html".to_string()],
      fallback_document: "./index.html".to_string(),
      skip_waiting_on_install: true,
      database: None,
      notification: NotificationDefaults::default(),
    }
  }
}

/// Partition roles; exactly one partition per role is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
  Precache,
  Runtime,
  RemoteApi,
}

/// Resolved, immutable settings handed to the engine and lifecycle controller.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub version: String,
  pub base_url: Url,
  pub precache_name: String,
  pub runtime_name: String,
  pub remote_api_name: String,
  pub precache_manifest: Vec<Url>,
  pub remote_api_origin: Option<Origin>,
  pub cdn_host: Option<String>,
  pub document_suffixes: Vec<String>,
  pub fallback_document: Url,
  pub skip_waiting_on_install: bool,
  pub notification: NotificationDefaults,
}

impl WorkerConfig {
  pub fn partition_name(&self, role: Role) -> &str {
    match role {
      Role::Precache => &self.precache_name,
      Role::Runtime => &self.runtime_name,
      Role::RemoteApi => &self.remote_api_name,
    }
  }

  /// The current partitions, in lookup order.
  pub fn current_partitions(&self) -> [&str; 3] {
    [
      self.precache_name.as_str(),
      self.runtime_name.as_str(),
      self.remote_api_name.as_str(),
    ]
  }

  /// Resolve a possibly relative URL against the worker location.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    self
      .base_url
      .join(url)
      .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  ///
  /// Without any file the built-in defaults are used.
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
      None => {
        tracing::debug!("No configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Path of the partition database.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shellcache").join("cache.db"))
  }

  /// Resolve names, URLs and origins into a [`WorkerConfig`].
  pub fn worker_config(&self) -> Result<WorkerConfig> {
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }

    let base_url = Url::parse(&self.base_url)
      .map_err(|e| eyre!("Invalid base_url '{}': {}", self.base_url, e))?;

    let resolve = |path: &str| {
      base_url
        .join(path)
        .map_err(|e| eyre!("Invalid URL '{}': {}", path, e))
    };

    let precache_manifest = self
      .precache_manifest
      .iter()
      .map(|p| resolve(p.as_str()))
      .collect::<Result<Vec<_>>>()?;

    let remote_api_origin = match &self.remote_api_origin {
      Some(origin) => Some(
        Url::parse(origin)
          .map_err(|e| eyre!("Invalid remote_api_origin '{}': {}", origin, e))?
          .origin(),
      ),
      None => None,
    };

    let fallback_document = resolve(self.fallback_document.as_str())?;
    let versioned = |base: &str| format!("{}-v{}", base, self.version);

    Ok(WorkerConfig {
      version: self.version.clone(),
      precache_name: versioned(&self.partitions.precache),
      runtime_name: versioned(&self.partitions.runtime),
      remote_api_name: versioned(&self.partitions.remote_api),
      precache_manifest,
      remote_api_origin,
      cdn_host: self.cdn_host.as_ref().map(|h| h.to_lowercase()),
      document_suffixes: self.document_suffixes.clone(),
      fallback_document,
      skip_waiting_on_install: self.skip_waiting_on_install,
      notification: self.notification.clone(),
      base_url,
    })
  }
}
