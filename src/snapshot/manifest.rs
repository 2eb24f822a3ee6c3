//! The manifest file produced by a snapshot run.

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::info;

/// URL recorded for entries assembled from several requests.
pub const COMPOSITE_URL: &str = "(composite)";

/// One pre-fetched API response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
  pub key: String,
  pub url: String,
  pub data: Value,
  /// Fetch time in milliseconds since the epoch
  pub timestamp: i64,
  pub etag: Option<String>,
}

impl ManifestEntry {
  pub fn is_composite(&self) -> bool {
    self.url == COMPOSITE_URL
  }

  /// Decode the stored response into `T`.
  pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_value(self.data.clone())
      .map_err(|e| eyre!("Manifest entry {} has unexpected shape: {}", self.key, e))
  }
}

/// Ordered list of entries, serialized as a bare JSON array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
  entries: Vec<ManifestEntry>,
}

impl Manifest {
  pub fn new(entries: Vec<ManifestEntry>) -> Self {
    Self { entries }
  }

  pub fn entries(&self) -> &[ManifestEntry] {
    &self.entries
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn find(&self, key: &str) -> Option<&ManifestEntry> {
    self.entries.iter().find(|e| e.key == key)
  }

  /// SHA-256 over everything except timestamps.
  ///
  /// Two runs against an unchanged backend produce the same fingerprint.
  pub fn fingerprint(&self) -> String {
    let mut hasher = Sha256::new();
    for entry in &self.entries {
      hasher.update(entry.key.as_bytes());
      hasher.update([0]);
      hasher.update(entry.url.as_bytes());
      hasher.update([0]);
      hasher.update(entry.data.to_string().as_bytes());
      hasher.update([0]);
      hasher.update(entry.etag.as_deref().unwrap_or("").as_bytes());
      hasher.update([0xff]);
    }
    hex::encode(hasher.finalize())
  }

  pub fn load(path: &Path) -> Result<Self> {
    let contents = fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read manifest {}: {}", path.display(), e))?;

    serde_json::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse manifest {}: {}", path.display(), e))
  }

  /// Serialize once, write to `cache_path`, then copy to `public_path`.
  pub fn publish(&self, cache_path: &Path, public_path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(self)
      .map_err(|e| eyre!("Failed to serialize manifest: {}", e))?;

    write_creating_dirs(cache_path, &json)?;

    if let Some(parent) = public_path.parent() {
      fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create directory {}: {}", parent.display(), e))?;
    }
    fs::copy(cache_path, public_path).map_err(|e| {
      eyre!(
        "Failed to copy manifest to {}: {}",
        public_path.display(),
        e
      )
    })?;

    info!(
      entries = self.len(),
      cache = %cache_path.display(),
      public = %public_path.display(),
      "manifest written"
    );
    Ok(())
  }
}

fn write_creating_dirs(path: &Path, contents: &str) -> Result<()> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent)
      .map_err(|e| eyre!("Failed to create directory {}: {}", parent.display(), e))?;
  }
  fs::write(path, contents).map_err(|e| eyre!("Failed to write manifest {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tempfile::TempDir;

  fn entry(key: &str, data: Value, timestamp: i64) -> ManifestEntry {
    ManifestEntry {
      key: key.to_string(),
      url: format!("https://api.example.com/{}", key),
      data,
      timestamp,
      etag: None,
    }
  }

  #[test]
  fn test_file_format() {
    let manifest = Manifest::new(vec![entry("services", json!([{"id": 1}]), 1_700_000_000_000)]);
    let value: Value = serde_json::to_value(&manifest).unwrap();
    assert_eq!(
      value,
      json!([{
        "key": "services",
        "url": "https://api.example.com/services",
        "data": [{"id": 1}],
        "timestamp": 1_700_000_000_000i64,
        "etag": null
      }])
    );
  }

  #[test]
  fn test_fingerprint_ignores_timestamps() {
    let a = Manifest::new(vec![entry("services", json!([1, 2]), 1)]);
    let b = Manifest::new(vec![entry("services", json!([1, 2]), 2)]);
    let c = Manifest::new(vec![entry("services", json!([1, 3]), 1)]);
    assert_eq!(a.fingerprint(), b.fingerprint());
    assert_ne!(a.fingerprint(), c.fingerprint());
  }

  #[test]
  fn test_publish_writes_both_locations() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let cache_path = temp_dir.path().join(".cache").join("api-manifest.json");
    let public_path = temp_dir.path().join("public").join("api-manifest.json");

    let manifest = Manifest::new(vec![entry("roles", json!(["admin"]), 5)]);
    manifest.publish(&cache_path, &public_path).expect("Publish should succeed");

    assert_eq!(Manifest::load(&cache_path).unwrap(), manifest);
    assert_eq!(
      fs::read_to_string(&cache_path).unwrap(),
      fs::read_to_string(&public_path).unwrap()
    );
  }

  #[test]
  fn test_publish_fails_when_unwritable() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let blocker = temp_dir.path().join("blocker");
    fs::write(&blocker, "").unwrap();

    let manifest = Manifest::default();
    let result = manifest.publish(&blocker.join("manifest.json"), &temp_dir.path().join("p.json"));
    assert!(result.is_err());
  }

  #[test]
  fn test_find_and_decode() {
    let manifest = Manifest::new(vec![entry("categories", json!(["Facials", "Peels"]), 5)]);
    let found = manifest.find("categories").unwrap();
    assert!(!found.is_composite());
    assert_eq!(
      found.decode::<Vec<String>>().unwrap(),
      vec!["Facials".to_string(), "Peels".to_string()]
    );
    assert!(manifest.find("missing").is_none());
  }
}
