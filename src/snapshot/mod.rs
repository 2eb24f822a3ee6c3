//! Build-time snapshot of API responses.
//!
//! Every configured endpoint is fetched once, failures are skipped, and the
//! successes are written as a manifest that runtime consumers can seed from.

mod composite;
mod manifest;

use chrono::Utc;
use futures::future::join_all;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::api::JsonSource;

pub use composite::assemble;
pub use manifest::{Manifest, ManifestEntry, COMPOSITE_URL};

/// Shape of a composite section when its request fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
  #[default]
  Object,
  List,
}

#[derive(Debug, Clone)]
pub struct Section {
  pub field: String,
  pub path: String,
  pub kind: SectionKind,
}

/// One entry to capture in the manifest.
#[derive(Debug, Clone)]
pub enum Endpoint {
  Url { key: String, path: String },
  Composite { key: String, sections: Vec<Section> },
}

impl Endpoint {
  pub fn key(&self) -> &str {
    match self {
      Endpoint::Url { key, .. } | Endpoint::Composite { key, .. } => key,
    }
  }
}

/// Outcome of a snapshot run.
#[derive(Debug)]
pub struct SnapshotReport {
  pub manifest: Manifest,
  /// Keys of endpoints that could not be fetched
  pub failed: Vec<String>,
}

pub struct SnapshotFetcher<S> {
  source: S,
  endpoints: Vec<Endpoint>,
}

impl<S: JsonSource> SnapshotFetcher<S> {
  pub fn new(source: S, endpoints: Vec<Endpoint>) -> Self {
    Self { source, endpoints }
  }

  pub fn endpoints(&self) -> &[Endpoint] {
    &self.endpoints
  }

  /// Fetch all endpoints concurrently. Individual failures never abort the run.
  pub async fn run(&self) -> SnapshotReport {
    let results = join_all(self.endpoints.iter().map(|e| self.capture(e))).await;

    let mut entries = Vec::with_capacity(results.len());
    let mut failed = Vec::new();
    for (endpoint, result) in self.endpoints.iter().zip(results) {
      match result {
        Ok(entry) => {
          debug!(key = %entry.key, url = %entry.url, "captured");
          entries.push(entry);
        }
        Err(e) => {
          warn!(key = %endpoint.key(), error = %e, "endpoint fetch failed");
          failed.push(endpoint.key().to_string());
        }
      }
    }

    SnapshotReport {
      manifest: Manifest::new(entries),
      failed,
    }
  }

  async fn capture(&self, endpoint: &Endpoint) -> color_eyre::Result<ManifestEntry> {
    match endpoint {
      Endpoint::Url { key, path } => {
        let response = self.source.get(path).await?;
        Ok(ManifestEntry {
          key: key.clone(),
          url: response.url,
          data: response.data,
          timestamp: Utc::now().timestamp_millis(),
          etag: response.etag,
        })
      }
      Endpoint::Composite { key, sections } => {
        let data = assemble(&self.source, key, sections).await;
        Ok(ManifestEntry {
          key: key.clone(),
          url: COMPOSITE_URL.to_string(),
          data,
          timestamp: Utc::now().timestamp_millis(),
          etag: None,
        })
      }
    }
  }
}
