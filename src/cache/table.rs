//! In-memory cache table shared by every transient consumer.
//!
//! The table is an explicit object rather than a global so tests (and
//! separate parts of an application) can each own an isolated one.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};

use super::traits::FetchError;

/// A fetch in progress, awaitable by any number of consumers.
pub type InFlight<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

/// One key's slot in the table.
#[derive(Clone)]
pub struct CacheRecord<T> {
  pub data: Option<T>,
  pub error: Option<FetchError>,
  /// When `data` was last written
  pub timestamp: Instant,
  in_flight: Option<(u64, InFlight<T>)>,
}

impl<T> CacheRecord<T> {
  fn pending(flight: (u64, InFlight<T>)) -> Self {
    Self {
      data: None,
      error: None,
      timestamp: Instant::now(),
      in_flight: Some(flight),
    }
  }

  pub fn age(&self) -> Duration {
    Instant::now().saturating_duration_since(self.timestamp)
  }

  /// Data exists and is younger than `ttl`. A zero `ttl` never goes stale.
  pub fn is_fresh(&self, ttl: Duration) -> bool {
    self.data.is_some() && (ttl.is_zero() || self.age() < ttl)
  }

  pub fn is_in_flight(&self) -> bool {
    self.in_flight.is_some()
  }
}

/// A flight handed back by [`CacheTable::join_or_start`].
pub struct Flight<T> {
  pub id: u64,
  pub future: InFlight<T>,
  /// True when this caller attached to someone else's fetch
  pub joined: bool,
}

pub struct CacheTable<T> {
  records: Mutex<HashMap<String, CacheRecord<T>>>,
  next_flight: AtomicU64,
  changes: broadcast::Sender<String>,
}

impl<T: Clone + Send + Sync + 'static> CacheTable<T> {
  pub fn new() -> Self {
    let (changes, _) = broadcast::channel(64);
    Self {
      records: Mutex::new(HashMap::new()),
      next_flight: AtomicU64::new(1),
      changes,
    }
  }

  // A panic while holding the lock cannot leave a record half-written,
  // so a poisoned table is still usable.
  fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheRecord<T>>> {
    self.records.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn get(&self, key: &str) -> Option<CacheRecord<T>> {
    self.lock().get(key).cloned()
  }

  pub fn data(&self, key: &str) -> Option<T> {
    self.lock().get(key).and_then(|r| r.data.clone())
  }

  /// Cached data for `key` if it is fresh under `ttl`.
  pub fn fresh_data(&self, key: &str, ttl: Duration) -> Option<T> {
    self
      .lock()
      .get(key)
      .filter(|r| r.is_fresh(ttl))
      .and_then(|r| r.data.clone())
  }

  pub fn contains(&self, key: &str) -> bool {
    self.lock().contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  /// Drop the record for `key`. A fetch still running for it will not write back.
  pub fn invalidate(&self, key: &str) -> bool {
    let removed = self.lock().remove(key).is_some();
    if removed {
      self.notify(key);
    }
    removed
  }

  pub fn clear(&self) {
    let keys: Vec<String> = self.lock().drain().map(|(k, _)| k).collect();
    for key in keys {
      self.notify(&key);
    }
  }

  /// Receive the key of every record that changes from now on.
  pub fn subscribe(&self) -> broadcast::Receiver<String> {
    self.changes.subscribe()
  }

  /// Attach to the in-flight fetch for `key`, or start a new one.
  ///
  /// Unless `force` is set, an existing flight is joined. Otherwise `start`
  /// is called with a fresh flight id and its future is published into the
  /// record before the lock is released, so any caller arriving afterwards
  /// joins it instead of starting a duplicate request.
  pub fn join_or_start<F>(&self, key: &str, force: bool, start: F) -> Flight<T>
  where
    F: FnOnce(u64) -> BoxFuture<'static, Result<T, FetchError>>,
  {
    let mut records = self.lock();

    if !force {
      if let Some((id, future)) = records.get(key).and_then(|r| r.in_flight.clone()) {
        return Flight {
          id,
          future,
          joined: true,
        };
      }
    }

    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
    let future = start(id).shared();
    match records.get_mut(key) {
      Some(record) => record.in_flight = Some((id, future.clone())),
      None => {
        records.insert(key.to_string(), CacheRecord::pending((id, future.clone())));
      }
    }

    Flight {
      id,
      future,
      joined: false,
    }
  }

  /// Record the outcome of flight `id`.
  ///
  /// Success replaces the data. Failure keeps `fallback` as the data when one
  /// exists and otherwise removes the record so the next read fetches again.
  /// Outcomes of superseded flights are dropped.
  pub fn settle(&self, key: &str, id: u64, outcome: &Result<T, FetchError>, fallback: Option<T>) {
    {
      let mut records = self.lock();
      let current = records
        .get(key)
        .and_then(|r| r.in_flight.as_ref().map(|(flight, _)| *flight));
      if current != Some(id) {
        return;
      }

      match (outcome, fallback) {
        (Ok(data), _) => {
          records.insert(
            key.to_string(),
            CacheRecord {
              data: Some(data.clone()),
              error: None,
              timestamp: Instant::now(),
              in_flight: None,
            },
          );
        }
        (Err(error), Some(fallback)) => {
          records.insert(
            key.to_string(),
            CacheRecord {
              data: Some(fallback),
              error: Some(error.clone()),
              timestamp: Instant::now(),
              in_flight: None,
            },
          );
        }
        (Err(_), None) => {
          records.remove(key);
        }
      }
    }

    self.notify(key);
  }

  fn notify(&self, key: &str) {
    // No subscribers is fine
    let _ = self.changes.send(key.to_string());
  }
}

impl<T: Clone + Send + Sync + 'static> Default for CacheTable<T> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;

  fn ready(value: Result<u32, FetchError>) -> BoxFuture<'static, Result<u32, FetchError>> {
    async move { value }.boxed()
  }

  #[tokio::test]
  async fn test_second_caller_joins_existing_flight() {
    let table = CacheTable::new();
    let first = table.join_or_start("services", false, |_| ready(Ok(1)));
    let second = table.join_or_start("services", false, |_| panic!("must not start"));

    assert!(!first.joined);
    assert!(second.joined);
    assert_eq!(first.id, second.id);
    assert!(table.get("services").unwrap().is_in_flight());
  }

  #[tokio::test]
  async fn test_force_starts_new_flight() {
    let table = CacheTable::new();
    let first = table.join_or_start("services", false, |_| ready(Ok(1)));
    let forced = table.join_or_start("services", true, |_| ready(Ok(2)));
    assert!(!forced.joined);
    assert_ne!(first.id, forced.id);

    // The superseded flight cannot overwrite the record
    table.settle("services", first.id, &Ok(1), None);
    assert!(table.data("services").is_none());

    table.settle("services", forced.id, &Ok(2), None);
    assert_eq!(table.data("services"), Some(2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_freshness_window() {
    let table = CacheTable::new();
    let flight = table.join_or_start("k", false, |_| ready(Ok(7)));
    table.settle("k", flight.id, &Ok(7), None);

    tokio::time::advance(Duration::from_millis(999)).await;
    assert_eq!(table.fresh_data("k", Duration::from_secs(1)), Some(7));

    tokio::time::advance(Duration::from_millis(2)).await;
    assert_eq!(table.fresh_data("k", Duration::from_secs(1)), None);
    // Zero ttl never goes stale
    assert_eq!(table.fresh_data("k", Duration::ZERO), Some(7));
  }

  #[tokio::test]
  async fn test_failure_without_fallback_removes_record() {
    let table: CacheTable<u32> = CacheTable::new();
    let flight = table.join_or_start("k", false, |_| ready(Err(eyre!("boom").into())));
    table.settle("k", flight.id, &Err(eyre!("boom").into()), None);
    assert!(!table.contains("k"));
  }

  #[tokio::test]
  async fn test_failure_with_fallback_keeps_data_and_error() {
    let table: CacheTable<u32> = CacheTable::new();
    let flight = table.join_or_start("k", false, |_| ready(Err(eyre!("boom").into())));
    table.settle("k", flight.id, &Err(eyre!("boom").into()), Some(3));

    let record = table.get("k").unwrap();
    assert_eq!(record.data, Some(3));
    assert_eq!(record.error.as_ref().map(|e| e.to_string()).as_deref(), Some("boom"));
    assert!(!record.is_in_flight());
  }

  #[tokio::test]
  async fn test_invalidate_notifies_subscribers() {
    let table = CacheTable::new();
    let mut changes = table.subscribe();
    let flight = table.join_or_start("k", false, |_| ready(Ok(1)));
    table.settle("k", flight.id, &Ok(1), None);
    assert_eq!(changes.recv().await.unwrap(), "k");

    assert!(table.invalidate("k"));
    assert_eq!(changes.recv().await.unwrap(), "k");
    assert!(!table.invalidate("k"));
    assert!(table.is_empty());
  }
}
