//! Read-through in-memory cache with request de-duplication.
//!
//! Every consumer of a key shares one [`CacheTable`] record. A consumer that
//! mounts while a fetch for its key is running attaches to that fetch instead
//! of issuing its own. Data older than the TTL is served immediately and
//! refreshed in the background (stale-while-revalidate).
//!
//! ```ignore
//! let cache = TransientCache::new();
//! let services = cache.acquire("services", fetch_services.clone(), ResourceOptions::default());
//! let state = services.settled().await;
//! render(state.data, state.loading, state.error);
//! ```

use color_eyre::eyre::eyre;
use futures::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::options::ResourceOptions;
use super::table::{CacheTable, Flight};
use super::traits::{FetchError, Fetcher, ResourceState};

/// Entry point for mounting transient consumers on a shared table.
pub struct TransientCache<T> {
  table: Arc<CacheTable<T>>,
}

impl<T: Clone + Send + Sync + 'static> TransientCache<T> {
  pub fn new() -> Self {
    Self::with_table(Arc::new(CacheTable::new()))
  }

  pub fn with_table(table: Arc<CacheTable<T>>) -> Self {
    Self { table }
  }

  pub fn table(&self) -> &Arc<CacheTable<T>> {
    &self.table
  }

  /// Mount a consumer for `key`.
  ///
  /// Must be called from within a Tokio runtime. The returned handle starts
  /// with cached data when there is any; a needed fetch runs in the background
  /// and its result is published to [`CachedResource::subscribe`].
  pub fn acquire(
    &self,
    key: impl Into<String>,
    fetcher: Fetcher<T>,
    options: ResourceOptions<T>,
  ) -> CachedResource<T> {
    let inner = Arc::new(Inner {
      key: key.into(),
      table: Arc::clone(&self.table),
      fetcher,
      options,
      state: watch::Sender::new(ResourceState::default()),
      mounted: AtomicBool::new(true),
    });

    // Subscribe before mounting so no change can slip between the two
    let changes = self.table.subscribe();
    let listener = tokio::spawn(Inner::follow(Arc::clone(&inner), changes));

    let mount = match inner.mount() {
      Step::Done(_) => None,
      Step::Await(flight) => {
        let inner = Arc::clone(&inner);
        Some(tokio::spawn(async move {
          inner.finish(flight).await;
        }))
      }
    };

    CachedResource {
      inner,
      mount,
      listener,
    }
  }

  /// Drop the record for `key`; the next mount or fetch goes to the network.
  pub fn invalidate(&self, key: &str) -> bool {
    self.table.invalidate(key)
  }

  pub fn clear(&self) {
    self.table.clear();
  }
}

impl<T: Clone + Send + Sync + 'static> Default for TransientCache<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Clone for TransientCache<T> {
  fn clone(&self) -> Self {
    Self {
      table: Arc::clone(&self.table),
    }
  }
}

/// A mounted consumer of one key.
///
/// Dropping the handle unmounts it: results arriving afterwards are ignored
/// by this consumer, although the fetch itself finishes and still updates
/// the shared table for everyone else.
pub struct CachedResource<T> {
  inner: Arc<Inner<T>>,
  mount: Option<JoinHandle<()>>,
  listener: JoinHandle<()>,
}

impl<T: Clone + Send + Sync + 'static> CachedResource<T> {
  pub fn key(&self) -> &str {
    &self.inner.key
  }

  /// Current state snapshot.
  pub fn state(&self) -> ResourceState<T> {
    self.inner.state.borrow().clone()
  }

  pub fn data(&self) -> Option<T> {
    self.inner.state.borrow().data.clone()
  }

  /// Watch every state change of this consumer.
  pub fn subscribe(&self) -> watch::Receiver<ResourceState<T>> {
    self.inner.state.subscribe()
  }

  /// Wait until no fetch is outstanding for this consumer and return the state.
  pub async fn settled(&self) -> ResourceState<T> {
    let mut rx = self.inner.state.subscribe();
    let settled = rx.wait_for(|state| !state.loading).await.map(|state| state.clone());
    settled.unwrap_or_else(|_| self.state())
  }

  /// Run a fetch for this key.
  ///
  /// Without `force`, fresh cached data is returned as is and a fetch already
  /// in flight is joined. With `force`, a new request is always made.
  pub async fn fetch(&self, force: bool) -> Option<T> {
    match self.inner.begin(force) {
      Step::Done(data) => data,
      Step::Await(flight) => self.inner.finish(flight).await,
    }
  }

  /// Forget the cached record and fetch again, skipping de-duplication.
  ///
  /// A disabled consumer leaves the shared record alone and serves it as is.
  pub async fn refresh(&self) -> Option<T> {
    if self.inner.options.enabled {
      self.inner.table.invalidate(&self.inner.key);
    }
    self.fetch(true).await
  }
}

impl<T> Drop for CachedResource<T> {
  fn drop(&mut self) {
    self.inner.mounted.store(false, Ordering::SeqCst);
    if let Some(mount) = &self.mount {
      mount.abort();
    }
    self.listener.abort();
  }
}

enum Step<T> {
  /// Nothing to wait for; carries the data served
  Done(Option<T>),
  Await(Flight<T>),
}

struct Inner<T> {
  key: String,
  table: Arc<CacheTable<T>>,
  fetcher: Fetcher<T>,
  options: ResourceOptions<T>,
  state: watch::Sender<ResourceState<T>>,
  mounted: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
  fn mount(&self) -> Step<T> {
    if !self.options.enabled {
      return self.serve_cached();
    }

    let record = match self.table.get(&self.key) {
      Some(record) if record.data.is_some() => record,
      // No record, or one still waiting for its first value
      _ => return self.begin(false),
    };

    if record.is_fresh(self.options.ttl) && !self.options.revalidate_on_mount {
      debug!(key = %self.key, "serving fresh cache entry");
      self.state.send_modify(|state| {
        state.data = record.data.clone();
        state.error = record.error.clone();
        state.loading = false;
        state.is_cached = true;
      });
      return Step::Done(record.data);
    }

    // Stale or explicitly revalidating: show what we have while fetching
    self.state.send_modify(|state| {
      state.data = record.data.clone();
      state.error = record.error.clone();
      state.is_cached = true;
    });
    self.begin(self.options.revalidate_on_mount)
  }

  fn serve_cached(&self) -> Step<T> {
    let data = self
      .table
      .data(&self.key)
      .or_else(|| self.state.borrow().data.clone());
    self.state.send_modify(|state| {
      state.data = data.clone();
      state.loading = false;
      state.is_cached = data.is_some();
    });
    Step::Done(data)
  }

  fn begin(&self, force: bool) -> Step<T> {
    if !self.options.enabled {
      return self.serve_cached();
    }

    if !force {
      if let Some(data) = self.table.fresh_data(&self.key, self.options.ttl) {
        self.state.send_modify(|state| {
          state.data = Some(data.clone());
          state.error = None;
          state.loading = false;
          state.is_cached = true;
        });
        return Step::Done(Some(data));
      }
    }

    let previous = self
      .table
      .data(&self.key)
      .or_else(|| self.state.borrow().data.clone());
    let fallback = self.options.fallback_data.clone().or(previous);

    let flight = self.table.join_or_start(&self.key, force, |id| {
      spawn_flight(
        Arc::clone(&self.table),
        self.key.clone(),
        id,
        Arc::clone(&self.fetcher),
        fallback,
      )
    });

    if flight.joined {
      debug!(key = %self.key, flight = flight.id, "joined in-flight fetch");
    }

    self.state.send_modify(|state| state.loading = true);
    Step::Await(flight)
  }

  async fn finish(&self, flight: Flight<T>) -> Option<T> {
    let outcome = flight.future.await;

    if !self.mounted.load(Ordering::SeqCst) {
      return None;
    }

    match outcome {
      Ok(data) => {
        self.state.send_modify(|state| {
          state.data = Some(data.clone());
          state.error = None;
          state.loading = false;
          state.is_cached = false;
        });
        Some(data)
      }
      Err(error) => {
        // The flight already stored its fallback (if any) in the table
        let data = self
          .options
          .fallback_data
          .clone()
          .or_else(|| self.table.data(&self.key))
          .or_else(|| self.state.borrow().data.clone());
        self.state.send_modify(|state| {
          state.data = data.clone();
          state.error = Some(error);
          state.loading = false;
          state.is_cached = false;
        });
        data
      }
    }
  }

  /// Mirror table writes made by other consumers of the same key.
  async fn follow(inner: Arc<Self>, mut changes: broadcast::Receiver<String>) {
    loop {
      match changes.recv().await {
        Ok(key) if key == inner.key => inner.sync_from_table(),
        Ok(_) => {}
        Err(broadcast::error::RecvError::Lagged(_)) => inner.sync_from_table(),
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
  }

  fn sync_from_table(&self) {
    if let Some(data) = self.table.data(&self.key) {
      self.state.send_modify(|state| state.data = Some(data));
    }
  }
}

/// Run the fetcher in its own task so it outlives any single consumer.
fn spawn_flight<T: Clone + Send + Sync + 'static>(
  table: Arc<CacheTable<T>>,
  key: String,
  id: u64,
  fetcher: Fetcher<T>,
  fallback: Option<T>,
) -> BoxFuture<'static, Result<T, FetchError>> {
  let handle = tokio::spawn(async move {
    let outcome = fetcher().await.map_err(FetchError::from);
    match &outcome {
      Ok(_) => debug!(key = %key, flight = id, "fetch succeeded"),
      Err(e) => warn!(key = %key, flight = id, error = %e, "fetch failed"),
    }
    table.settle(&key, id, &outcome, fallback);
    outcome
  });

  async move {
    handle
      .await
      .unwrap_or_else(|e| Err(FetchError::from(eyre!("Fetch task failed: {}", e))))
  }
  .boxed()
}
