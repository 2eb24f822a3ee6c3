//! Read-through cache backed by durable storage.
//!
//! Unlike the transient cache there is no request sharing: each mounted
//! consumer fetches on its own. Stored data survives restarts, is shown
//! immediately on mount (even when stale), and is rechecked by a background
//! revalidation task.

use chrono::Utc;
use color_eyre::eyre::eyre;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::options::PersistentOptions;
use super::storage::StorageAdapter;
use super::traits::{FetchError, Fetcher, ResourceState};
use crate::snapshot::Manifest;

/// Serialized form of one durable entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentRecord<T> {
  pub data: Option<T>,
  /// Message of the failure recorded alongside fallback data
  pub error: Option<String>,
  /// Write time of `data`/`error`, in milliseconds since the epoch
  pub timestamp: i64,
  /// Validator carried over from the snapshot manifest; not used for conditional fetches
  pub etag: Option<String>,
}

impl<T> PersistentRecord<T> {
  pub fn new(data: T) -> Self {
    Self {
      data: Some(data),
      error: None,
      timestamp: now_millis(),
      etag: None,
    }
  }

  pub fn age(&self) -> Duration {
    let age = now_millis().saturating_sub(self.timestamp).max(0);
    Duration::from_millis(age as u64)
  }

  /// Older than `ttl`. A zero `ttl` never goes stale.
  pub fn is_stale(&self, ttl: Duration) -> bool {
    !ttl.is_zero() && self.age() > ttl
  }
}

fn now_millis() -> i64 {
  Utc::now().timestamp_millis()
}

/// Entry point for mounting persistent consumers.
#[derive(Clone)]
pub struct PersistentCache {
  storage: Arc<StorageAdapter>,
}

impl PersistentCache {
  pub fn new(storage: StorageAdapter) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  pub fn storage(&self) -> &StorageAdapter {
    &self.storage
  }

  /// Mount a consumer for `key`.
  ///
  /// Storage is read once, here. Must be called from within a Tokio runtime.
  pub fn acquire<T>(
    &self,
    key: impl Into<String>,
    fetcher: Fetcher<T>,
    options: PersistentOptions<T>,
  ) -> PersistentResource<T>
  where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
  {
    let key = key.into();
    let stored = if options.persist {
      self.storage.load::<PersistentRecord<T>>(&key)
    } else {
      None
    };

    let mut initial = ResourceState::default();
    let mut etag = None;
    if let Some(record) = stored {
      initial.is_stale = record.is_stale(options.ttl);
      initial.is_cached = record.data.is_some();
      initial.data = record.data;
      initial.error = record.error.map(FetchError::msg);
      etag = record.etag;
      debug!(key = %key, stale = initial.is_stale, "loaded durable entry");
    }

    let needs_fetch = options.enabled && !(initial.is_cached && !initial.is_stale);
    let interval = options.revalidate_interval;
    let revalidate = options.enabled && !interval.is_zero();

    let inner = Arc::new(Inner {
      key,
      storage: Arc::clone(&self.storage),
      fetcher,
      options,
      state: watch::Sender::new(initial),
      etag: Mutex::new(etag),
      mounted: AtomicBool::new(true),
    });

    let mount = needs_fetch.then(|| {
      let inner = Arc::clone(&inner);
      tokio::spawn(async move {
        inner.fetch().await;
      })
    });

    let revalidator = revalidate.then(|| {
      let stale = inner.state.borrow().is_stale;
      tokio::spawn(Inner::revalidate(Arc::clone(&inner), interval, stale))
    });

    PersistentResource {
      inner,
      mount,
      revalidator,
    }
  }

  /// Write manifest entries as durable records, keeping their timestamp and etag.
  ///
  /// Keys that already have a stored record are left alone. Returns how many
  /// entries were written.
  pub fn seed_from_manifest(&self, manifest: &Manifest) -> usize {
    let mut written = 0;
    for entry in manifest.entries() {
      if self.storage.get(&entry.key).is_some() {
        debug!(key = %entry.key, "durable entry exists, not seeding");
        continue;
      }

      let record = PersistentRecord {
        data: Some(entry.data.clone()),
        error: None,
        timestamp: entry.timestamp,
        etag: entry.etag.clone(),
      };
      if self.storage.store(&entry.key, &record) {
        written += 1;
      }
    }

    info!(written, total = manifest.len(), "seeded durable cache from manifest");
    written
  }

  pub fn remove(&self, key: &str) -> bool {
    self.storage.remove(key)
  }
}

/// A mounted persistent consumer. Dropping it stops revalidation and
/// discards any result still on its way.
pub struct PersistentResource<T> {
  inner: Arc<Inner<T>>,
  mount: Option<JoinHandle<()>>,
  revalidator: Option<JoinHandle<()>>,
}

impl<T> PersistentResource<T>
where
  T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
  pub fn key(&self) -> &str {
    &self.inner.key
  }

  pub fn state(&self) -> ResourceState<T> {
    self.inner.state.borrow().clone()
  }

  pub fn data(&self) -> Option<T> {
    self.inner.state.borrow().data.clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<ResourceState<T>> {
    self.inner.state.subscribe()
  }

  /// Etag of the stored record this consumer started from, if any.
  pub fn etag(&self) -> Option<String> {
    self.inner.etag()
  }

  /// Fetch unconditionally and write the result through to storage.
  pub async fn fetch(&self) -> Option<T> {
    self.inner.fetch().await
  }

  pub async fn refresh(&self) -> Option<T> {
    self.inner.fetch().await
  }
}

impl<T> Drop for PersistentResource<T> {
  fn drop(&mut self) {
    self.inner.mounted.store(false, Ordering::SeqCst);
    if let Some(mount) = &self.mount {
      mount.abort();
    }
    if let Some(revalidator) = &self.revalidator {
      revalidator.abort();
    }
  }
}

struct Inner<T> {
  key: String,
  storage: Arc<StorageAdapter>,
  fetcher: Fetcher<T>,
  options: PersistentOptions<T>,
  state: watch::Sender<ResourceState<T>>,
  etag: Mutex<Option<String>>,
  mounted: AtomicBool,
}

impl<T> Inner<T>
where
  T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
  fn etag(&self) -> Option<String> {
    self.etag.lock().ok().and_then(|etag| etag.clone())
  }

  fn set_etag(&self, etag: Option<String>) {
    if let Ok(mut current) = self.etag.lock() {
      *current = etag;
    }
  }

  async fn fetch(&self) -> Option<T> {
    if !self.options.enabled {
      return self.state.borrow().data.clone();
    }

    self.state.send_modify(|state| state.loading = true);

    // The request runs in its own task so unmounting does not cancel it
    let fetcher = Arc::clone(&self.fetcher);
    let outcome = tokio::spawn(async move { fetcher().await })
      .await
      .unwrap_or_else(|e| Err(eyre!("Fetch task failed: {}", e)))
      .map_err(FetchError::from);

    if !self.mounted.load(Ordering::SeqCst) {
      return None;
    }

    match outcome {
      Ok(data) => {
        debug!(key = %self.key, "fetch succeeded");
        if self.options.persist {
          self.storage.store(&self.key, &PersistentRecord::new(data.clone()));
        }
        self.set_etag(None);
        self.state.send_modify(|state| {
          state.data = Some(data.clone());
          state.error = None;
          state.loading = false;
          state.is_cached = false;
          state.is_stale = false;
        });
        Some(data)
      }
      Err(error) => {
        warn!(key = %self.key, error = %error, "fetch failed");
        let fallback = self
          .options
          .fallback_data
          .clone()
          .or_else(|| self.state.borrow().data.clone());

        if let (Some(data), true) = (&fallback, self.options.persist) {
          let record = PersistentRecord {
            data: Some(data.clone()),
            error: Some(error.to_string()),
            timestamp: now_millis(),
            etag: self.etag(),
          };
          self.storage.store(&self.key, &record);
        }

        self.state.send_modify(|state| {
          state.data = fallback.clone();
          state.error = Some(error);
          state.loading = false;
        });
        fallback
      }
    }
  }

  /// Self-rescheduling staleness check.
  ///
  /// Each cycle acts on the `is_stale` value captured when it was scheduled,
  /// so a change to the flag is only noticed one cycle later.
  async fn revalidate(inner: Arc<Self>, interval: Duration, mut stale: bool) {
    loop {
      tokio::time::sleep(interval).await;
      if stale {
        debug!(key = %inner.key, "revalidating stale entry");
        inner.fetch().await;
      }
      stale = inner.state.borrow().is_stale;
    }
  }
}
