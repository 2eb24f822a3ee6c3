//! Core types shared by the cache managers.

use color_eyre::{Report, Result};
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A factory that produces a fresh fetch future each time it is called.
///
/// Consumers of the same key should share one `Fetcher` (clone the `Arc`);
/// the transient cache relies on that to de-duplicate in-flight requests.
pub type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Wrap a closure returning a future into a [`Fetcher`].
///
/// ```ignore
/// let api = client.clone();
/// let services = fetcher(move || {
///   let api = api.clone();
///   async move { api.get_as::<Vec<Service>>("services").await }
/// });
/// ```
pub fn fetcher<T, F, Fut>(f: F) -> Fetcher<T>
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T>> + Send + 'static,
{
  Arc::new(move || f().boxed())
}

/// A fetch failure that can be handed to every consumer awaiting the same flight.
#[derive(Clone)]
pub struct FetchError(Arc<Report>);

impl FetchError {
  /// Build an error from a plain message, e.g. one restored from durable storage.
  pub fn msg(message: impl Into<String>) -> Self {
    Self(Arc::new(Report::msg(message.into())))
  }
}

impl From<Report> for FetchError {
  fn from(report: Report) -> Self {
    Self(Arc::new(report))
  }
}

impl fmt::Display for FetchError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl fmt::Debug for FetchError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("FetchError")
      .field(&self.0.to_string())
      .finish()
  }
}

impl std::error::Error for FetchError {}

/// What a mounted consumer sees for its key.
#[derive(Debug, Clone)]
pub struct ResourceState<T> {
  /// Last good value, or the fallback substituted after a failure
  pub data: Option<T>,
  /// Most recent fetch failure, cleared by the next success
  pub error: Option<FetchError>,
  /// A fetch started by this consumer is still outstanding
  pub loading: bool,
  /// `data` was served from the cache rather than a fetch made for this consumer
  pub is_cached: bool,
  /// Stored data is older than the TTL (persistent manager only)
  pub is_stale: bool,
}

impl<T> Default for ResourceState<T> {
  fn default() -> Self {
    Self {
      data: None,
      error: None,
      loading: false,
      is_cached: false,
      is_stale: false,
    }
  }
}

impl<T> ResourceState<T> {
  pub fn has_data(&self) -> bool {
    self.data.is_some()
  }

  /// Error message, if the last fetch failed.
  pub fn error_message(&self) -> Option<String> {
    self.error.as_ref().map(|e| e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;

  #[tokio::test]
  async fn test_fetcher_produces_fresh_futures() {
    let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let counter_clone = counter.clone();
    let f = fetcher(move || {
      let counter = counter_clone.clone();
      async move { Ok(counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst)) }
    });

    assert_eq!(f().await.unwrap(), 0);
    assert_eq!(f().await.unwrap(), 1);
  }

  #[test]
  fn test_fetch_error_is_shared_between_clones() {
    let error = FetchError::from(eyre!("gateway timeout"));
    let copy = error.clone();
    assert_eq!(error.to_string(), "gateway timeout");
    assert_eq!(copy.to_string(), "gateway timeout");
    assert!(Arc::ptr_eq(&error.0, &copy.0));
  }

  #[test]
  fn test_default_state_is_empty() {
    let state: ResourceState<u8> = ResourceState::default();
    assert!(!state.has_data());
    assert!(!state.loading);
    assert!(state.error_message().is_none());
  }
}
