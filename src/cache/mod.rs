//! Client-side query cache.
//!
//! This module provides the shared cache that mutations write to:
//! - Structural, hierarchical keys with prefix invalidation
//! - Synchronous subscriber notification after each (batched) write
//! - Snapshots for undoing optimistic writes
//! - Stale-time reads with offline fallback
//! - Optional persistence of entries tagged persistable

mod entry;
mod key;
mod layer;
mod snapshot;
mod storage;
mod store;

pub use entry::{CacheEntry, CacheEvent, QueryStatus};
pub use key::{KeyError, KeyPart, QueryKey};
pub use layer::{CacheLayer, CacheResult, CacheSource, DEFAULT_APP_KEY};
pub use snapshot::Snapshot;
pub use storage::{CacheStorage, NoopStorage, PersistedEntry, SqliteStorage};
pub use store::{CacheStore, CacheWrite, Fetcher, Listener, Subscription};
