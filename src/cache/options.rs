//! Per-consumer options for the two cache managers.

use std::time::Duration;

use crate::config::CacheConfig;

/// Options for [`TransientCache::acquire`](super::TransientCache::acquire).
#[derive(Debug, Clone)]
pub struct ResourceOptions<T> {
  /// When false nothing is fetched; the last cached value (if any) is served
  pub enabled: bool,
  /// Age after which cached data is refetched on mount. Zero means never stale.
  pub ttl: Duration,
  /// Substituted when a fetch fails and no cached value exists
  pub fallback_data: Option<T>,
  /// Fetch on mount even when the cached data is fresh
  pub revalidate_on_mount: bool,
}

impl<T> Default for ResourceOptions<T> {
  fn default() -> Self {
    Self {
      enabled: true,
      ttl: Duration::from_secs(300),
      fallback_data: None,
      revalidate_on_mount: false,
    }
  }
}

impl<T> ResourceOptions<T> {
  pub fn from_config(config: &CacheConfig) -> Self {
    Self {
      ttl: config.ttl(),
      ..Self::default()
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn with_fallback(mut self, data: T) -> Self {
    self.fallback_data = Some(data);
    self
  }

  pub fn with_enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn revalidate_on_mount(mut self) -> Self {
    self.revalidate_on_mount = true;
    self
  }
}

/// Options for [`PersistentCache::acquire`](super::PersistentCache::acquire).
#[derive(Debug, Clone)]
pub struct PersistentOptions<T> {
  pub enabled: bool,
  /// Age after which the stored record is stale. Zero means never stale.
  pub ttl: Duration,
  pub fallback_data: Option<T>,
  /// Read from and write through to durable storage
  pub persist: bool,
  /// Period of the background staleness check. Zero disables it.
  pub revalidate_interval: Duration,
}

impl<T> Default for PersistentOptions<T> {
  fn default() -> Self {
    Self {
      enabled: true,
      ttl: Duration::from_secs(1800),
      fallback_data: None,
      persist: true,
      revalidate_interval: Duration::from_secs(300),
    }
  }
}

impl<T> PersistentOptions<T> {
  pub fn from_config(config: &CacheConfig) -> Self {
    Self {
      ttl: config.persistent_ttl(),
      revalidate_interval: config.revalidate_interval(),
      ..Self::default()
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn with_fallback(mut self, data: T) -> Self {
    self.fallback_data = Some(data);
    self
  }

  pub fn with_enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn with_persist(mut self, persist: bool) -> Self {
    self.persist = persist;
    self
  }

  pub fn with_revalidate_interval(mut self, interval: Duration) -> Self {
    self.revalidate_interval = interval;
    self
  }
}
