use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::snapshot::{Endpoint, Section, SectionKind};

/// Environment variable that overrides `api.base_url`.
pub const API_URL_ENV: &str = "GLOWCACHE_API_URL";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub snapshot: SnapshotConfig,
  /// Write logs to a daily rolling file in this directory instead of stderr
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL that endpoint paths are resolved against (e.g. "https://api.example.com/v1/")
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  15
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Freshness window for the in-memory cache (0 = never stale)
  pub ttl_secs: u64,
  /// Freshness window for durable records (0 = never stale)
  pub persistent_ttl_secs: u64,
  /// Period of the background staleness check (0 = disabled)
  pub revalidate_interval_secs: u64,
  /// Namespace prepended to every durable key
  pub storage_prefix: String,
  /// SQLite database backing durable records
  pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: 300,
      persistent_ttl_secs: 1800,
      revalidate_interval_secs: 300,
      storage_prefix: crate::cache::DEFAULT_PREFIX.to_string(),
      database: None,
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> Duration {
    Duration::from_secs(self.ttl_secs)
  }

  pub fn persistent_ttl(&self) -> Duration {
    Duration::from_secs(self.persistent_ttl_secs)
  }

  pub fn revalidate_interval(&self) -> Duration {
    Duration::from_secs(self.revalidate_interval_secs)
  }

  /// Configured database path, or `<data_dir>/glowcache/cache.db`.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("glowcache").join("cache.db"))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
  /// Manifest location read by tooling
  pub cache_path: PathBuf,
  /// Copy served as a static asset
  pub public_path: PathBuf,
  pub endpoints: Vec<EndpointConfig>,
}

impl Default for SnapshotConfig {
  fn default() -> Self {
    Self {
      cache_path: PathBuf::from(".cache/api-manifest.json"),
      public_path: PathBuf::from("public/api-manifest.json"),
      endpoints: Vec::new(),
    }
  }
}

impl SnapshotConfig {
  pub fn endpoints(&self) -> Vec<Endpoint> {
    self.endpoints.iter().cloned().map(Endpoint::from).collect()
  }
}

/// An endpoint as written in the config file.
///
/// A plain endpoint has a `path`; a composite lists `sections` fetched in parallel.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EndpointConfig {
  Url {
    key: String,
    path: String,
  },
  Composite {
    key: String,
    sections: Vec<SectionConfig>,
  },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SectionConfig {
  pub field: String,
  pub path: String,
  #[serde(default)]
  pub kind: SectionKind,
}

impl From<EndpointConfig> for Endpoint {
  fn from(config: EndpointConfig) -> Self {
    match config {
      EndpointConfig::Url { key, path } => Endpoint::Url { key, path },
      EndpointConfig::Composite { key, sections } => Endpoint::Composite {
        key,
        sections: sections
          .into_iter()
          .map(|s| Section {
            field: s.field,
            path: s.path,
            kind: s.kind,
          })
          .collect(),
      },
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./glowcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/glowcache/config.yaml
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
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/glowcache/config.yaml\n\
                 See glowcache.example.yaml for the format."
        ))
      }
    };

    if let Ok(url) = std::env::var(API_URL_ENV) {
      config.api.base_url = url;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("glowcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("glowcache").join("config.yaml");
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
}
