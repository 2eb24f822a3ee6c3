//! Caching layer for API data.
//!
//! Two managers share the same handle shape ([`ResourceState`]):
//! - [`TransientCache`] keeps results in memory, joins concurrent requests for
//!   the same key and expires entries after a TTL
//! - [`PersistentCache`] writes results through a [`StorageAdapter`] so they
//!   survive restarts, and revalidates stale records in the background

mod options;
mod persistent;
mod storage;
mod table;
mod traits;
mod transient;

pub use options::{PersistentOptions, ResourceOptions};
pub use persistent::{PersistentCache, PersistentRecord, PersistentResource};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore, StorageAdapter, DEFAULT_PREFIX};
pub use table::{CacheRecord, CacheTable};
pub use traits::{fetcher, FetchError, Fetcher, ResourceState};
pub use transient::{CachedResource, TransientCache};
