//! Cache layer that pairs the in-memory store with stale-time reads and
//! persistence.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, QueryStatus};
use super::key::QueryKey;
use super::storage::{CacheStorage, PersistedEntry};
use super::store::{CacheStore, CacheWrite};

/// Application key used when none is configured.
pub const DEFAULT_APP_KEY: &str = "qsync";

/// A value read through the layer, with where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the served value was written to the cache
  pub updated_at: DateTime<Utc>,
}

/// Indicates where served data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, invalidated or older than the stale time
  CacheStale,
  /// Network unavailable, serving stale cached data
  Offline,
}

/// Cache layer that manages stale-time reads and persistence.
///
/// This sits between call sites and their network fetchers, serving fresh
/// cache hits directly and falling back to stale data when a refresh fails.
pub struct CacheLayer<S: CacheStorage> {
  store: CacheStore,
  storage: Arc<S>,
  app_key: String,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl<S: CacheStorage> CacheLayer<S> {
  pub fn new(store: CacheStore, storage: S, app_key: impl Into<String>) -> Self {
    Self {
      store,
      storage: Arc::new(storage),
      app_key: app_key.into(),
      stale_time: Duration::minutes(5),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  /// Invalidated entries and entries older than the stale time are stale.
  pub fn is_stale(&self, entry: &CacheEntry) -> bool {
    entry.stale || Utc::now() - entry.updated_at > self.stale_time
  }

  /// Serve whatever is cached for `key` without fetching.
  pub fn peek<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<CacheResult<T>> {
    let entry = self.store.get(key)?;
    let data = entry.value_as()?;
    let source = if self.is_stale(&entry) {
      CacheSource::CacheStale
    } else {
      CacheSource::CacheFresh
    };
    Some(CacheResult {
      data,
      source,
      updated_at: entry.updated_at,
    })
  }

  /// Read `key` cache-first.
  ///
  /// 1. Fresh cache hit - return immediately
  /// 2. Stale or missing - fetch and write through to the store
  /// 3. Fetch failed with stale data present - serve it as offline
  pub async fn fetch<T, F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<CacheResult<T>>
  where
    T: DeserializeOwned + Serialize,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let cached = self.peek::<T>(key);
    if let Some(hit) = cached {
      if hit.source == CacheSource::CacheFresh {
        return Ok(hit);
      }

      return match fetcher().await {
        Ok(data) => self.write_through(key, data),
        Err(e) => {
          warn!(%key, error = %e, "refresh failed, serving cached data");
          Ok(CacheResult {
            source: CacheSource::Offline,
            ..hit
          })
        }
      };
    }

    // No cache, must fetch from network
    let data = fetcher().await?;
    self.write_through(key, data)
  }

  fn write_through<T: Serialize>(&self, key: &QueryKey, data: T) -> Result<CacheResult<T>> {
    let value =
      serde_json::to_value(&data).map_err(|e| eyre!("Failed to serialize {}: {}", key, e))?;
    self.store.set(key.clone(), value, QueryStatus::Success);
    Ok(CacheResult {
      data,
      source: CacheSource::Network,
      updated_at: Utc::now(),
    })
  }

  /// Load persisted entries into the store. Returns how many were restored.
  pub fn hydrate(&self) -> Result<usize> {
    let persisted = self.storage.load(&self.app_key)?;
    let writes: Vec<CacheWrite> = persisted
      .into_iter()
      .filter(|p| self.store.is_persistable(&p.key, &p.entry))
      .map(|p| CacheWrite::Put(p.key, p.entry))
      .collect();
    let restored = writes.len();
    self.store.apply(writes);
    info!(app_key = %self.app_key, restored, "hydrated cache");
    Ok(restored)
  }

  /// Write every persistable entry to storage. Returns how many were written.
  pub fn persist(&self) -> Result<usize> {
    let entries: Vec<PersistedEntry> = self
      .store
      .persistable_entries()
      .into_iter()
      .map(|(key, entry)| PersistedEntry { key, entry })
      .collect();
    self.storage.save(&self.app_key, &entries)?;
    debug!(app_key = %self.app_key, written = entries.len(), "persisted cache");
    Ok(entries.len())
  }

  /// Drop everything persisted for this application key.
  pub fn clear(&self) -> Result<()> {
    self.storage.clear(&self.app_key)
  }

  /// Persisted entries, without touching the in-memory store.
  pub fn stored(&self) -> Result<Vec<PersistedEntry>> {
    self.storage.load(&self.app_key)
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      storage: Arc::clone(&self.storage),
      app_key: self.app_key.clone(),
      stale_time: self.stale_time,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{NoopStorage, SqliteStorage};

  fn todos() -> QueryKey {
    QueryKey::new("todos")
  }

  #[tokio::test]
  async fn test_fetch_miss_then_fresh_hit() {
    let layer = CacheLayer::new(CacheStore::new(), NoopStorage, "test");

    let first = layer
      .fetch(&todos(), || async { Ok(vec![1u32, 2]) })
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second = layer
      .fetch(&todos(), || async { Err::<Vec<u32>, _>(eyre!("should not be called")) })
      .await
      .unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.data, vec![1, 2]);
  }

  #[tokio::test]
  async fn test_stale_entry_is_refreshed() {
    let store = CacheStore::new();
    let layer = CacheLayer::new(store.clone(), NoopStorage, "test");
    store.set(todos(), serde_json::json!([1]), QueryStatus::Success);
    store.invalidate(&todos());

    let result = layer
      .fetch(&todos(), || async { Ok(vec![1u32, 2, 3]) })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(store.get_as::<Vec<u32>>(&todos()), Some(vec![1, 2, 3]));
  }

  #[tokio::test]
  async fn test_offline_fallback_serves_stale_data() {
    let store = CacheStore::new();
    let layer = CacheLayer::new(store.clone(), NoopStorage, "test").with_stale_time(Duration::zero());
    store.set(todos(), serde_json::json!([7]), QueryStatus::Success);

    let result = layer
      .fetch(&todos(), || async { Err::<Vec<u32>, _>(eyre!("network down")) })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data, vec![7]);
  }

  #[tokio::test]
  async fn test_fetch_miss_propagates_error() {
    let layer = CacheLayer::new(CacheStore::new(), NoopStorage, "test");
    let result = layer
      .fetch(&todos(), || async { Err::<Vec<u32>, _>(eyre!("network down")) })
      .await;
    assert!(result.is_err());
  }

  #[test]
  fn test_persist_then_hydrate_only_persistable() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());

    let store = CacheStore::new();
    store.mark_persistable(todos());
    store.set(todos().with("all"), serde_json::json!([1]), QueryStatus::Success);
    store.set(QueryKey::new("session"), serde_json::json!("token"), QueryStatus::Success);
    let layer = CacheLayer::new(store, SharedStorage(Arc::clone(&storage)), "app");
    assert_eq!(layer.persist().unwrap(), 1);

    let fresh = CacheStore::new();
    fresh.mark_persistable(todos());
    let layer = CacheLayer::new(fresh.clone(), SharedStorage(storage), "app");
    assert_eq!(layer.hydrate().unwrap(), 1);
    assert_eq!(fresh.get_as::<Vec<u32>>(&todos().with("all")), Some(vec![1]));
    assert!(fresh.get(&QueryKey::new("session")).is_none());

    let stored = layer.stored().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].key, todos().with("all"));
    assert_eq!(fresh.entries_under(&todos()).len(), 1);
  }

  struct SharedStorage(Arc<SqliteStorage>);

  impl CacheStorage for SharedStorage {
    fn load(&self, app_key: &str) -> Result<Vec<PersistedEntry>> {
      self.0.load(app_key)
    }

    fn save(&self, app_key: &str, entries: &[PersistedEntry]) -> Result<()> {
      self.0.save(app_key, entries)
    }

    fn clear(&self, app_key: &str) -> Result<()> {
      self.0.clear(app_key)
    }
  }
}
