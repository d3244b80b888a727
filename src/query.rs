//! Query observer bound to one key of the shared cache.
//!
//! A `Query<T>` registers the key's fetcher with the [`CacheStore`],
//! subscribes to changes, and exposes a typed view of the entry. Optimistic
//! writes, rollbacks and invalidation refetches made by mutations show up
//! here on the next `poll()`.
//!
//! # Example
//!
//! ```ignore
//! let api = api.clone();
//! let mut query = Query::new(store.clone(), QueryKey::new("todos"), move || {
//!     let api = api.clone();
//!     async move { api.list_todos().await.map_err(|e| e.to_string()) }
//! });
//!
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! match query.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(todos) => render_list(todos),
//!     QueryState::Error(e) => render_error(e),
//!     QueryState::Idle => {}
//! }
//! ```

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::{CacheEntry, CacheEvent, CacheStore, QueryKey, QueryStatus, Subscription};

/// The state of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
  /// Nothing cached and no fetch started
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Cached value, authoritative or optimistic
  Success(T),
  /// Query failed with an error
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

impl<T: DeserializeOwned> QueryState<T> {
  fn from_entry(entry: Option<&CacheEntry>) -> Self {
    let Some(entry) = entry else {
      return QueryState::Idle;
    };
    match entry.status {
      QueryStatus::Idle => QueryState::Idle,
      QueryStatus::Pending => QueryState::Loading,
      QueryStatus::Error => {
        QueryState::Error(entry.error.clone().unwrap_or_else(|| "fetch failed".to_string()))
      }
      QueryStatus::Success => match entry.value_as() {
        Some(data) => QueryState::Success(data),
        None => QueryState::Error("cached value has an unexpected shape".to_string()),
      },
    }
  }
}

/// Typed observer over one cache key.
///
/// Query<T> encapsulates:
/// - The fetcher, registered with the store so invalidation can refetch
/// - Loading/success/error states derived from the cache entry
/// - Change events delivered over a channel
/// - Optional stale time tracking on top of explicit invalidation
pub struct Query<T> {
  store: CacheStore,
  key: QueryKey,
  state: QueryState<T>,
  events: mpsc::UnboundedReceiver<CacheEvent>,
  task: Option<JoinHandle<bool>>,
  stale_time: Duration,
  _subscription: Subscription,
}

impl<T> Query<T>
where
  T: Serialize + DeserializeOwned + Send + 'static,
{
  /// Create a query for `key`, registering `fetcher` as its source.
  ///
  /// The fetcher is called each time `fetch()` or `refetch()` is invoked,
  /// and whenever a mutation invalidates the key.
  pub fn new<F, Fut>(store: CacheStore, key: QueryKey, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    store.register_fetcher(key.clone(), move || {
      let pending = fetcher();
      async move {
        let data = pending.await?;
        serde_json::to_value(data).map_err(|e| e.to_string())
      }
    });

    let (tx, events) = mpsc::unbounded_channel();
    let subscription = store.subscribe(key.clone(), move |event| {
      // Receiver may have been dropped
      let _ = tx.send(event.clone());
    });
    let state = QueryState::from_entry(store.get(&key).as_ref());

    Self {
      store,
      key,
      state,
      events,
      task: None,
      stale_time: Duration::from_secs(60), // Default 1 minute
      _subscription: subscription,
    }
  }

  /// Set the stale time for this query.
  ///
  /// After this duration the data is considered stale even if nothing
  /// invalidated it.
  pub fn with_stale_time(mut self, duration: Duration) -> Self {
    self.stale_time = duration;
    self
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  /// Get the data if the query has a value.
  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// Whether the value was invalidated or is older than the stale time.
  pub fn is_stale(&self) -> bool {
    if !self.state.is_success() {
      return false;
    }
    match self.store.get(&self.key) {
      Some(entry) if entry.stale => true,
      Some(entry) => match chrono::Duration::from_std(self.stale_time) {
        Ok(limit) => Utc::now() - entry.updated_at > limit,
        Err(_) => false,
      },
      None => true,
    }
  }

  /// Start fetching data if not already loading.
  pub fn fetch(&mut self) {
    if self.state.is_loading() {
      return;
    }
    self.start_fetch();
  }

  /// Force a refetch, aborting any fetch this query started.
  pub fn refetch(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
    self.start_fetch();
  }

  /// Drain change events and re-read the entry.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    let mut seen = 0;
    while self.events.try_recv().is_ok() {
      seen += 1;
    }
    if seen == 0 {
      return false;
    }
    let next = QueryState::from_entry(self.store.get(&self.key).as_ref());
    let changed = !same_state(&self.state, &next, &self.store, &self.key);
    self.state = next;
    changed
  }

  fn start_fetch(&mut self) {
    let Some(fetcher) = self.store.begin_fetch(&self.key) else {
      return;
    };
    self.state = QueryState::Loading;
    debug!(key = %self.key, "query fetch started");

    let store = self.store.clone();
    let key = self.key.clone();
    self.task = Some(tokio::spawn(async move { store.finish_fetch(key, fetcher).await }));
  }
}

/// States compare through their cached JSON so `T` needs no `PartialEq`.
fn same_state<T>(current: &QueryState<T>, next: &QueryState<T>, store: &CacheStore, key: &QueryKey) -> bool
where
  T: Serialize,
{
  match (current, next) {
    (QueryState::Idle, QueryState::Idle) | (QueryState::Loading, QueryState::Loading) => true,
    (QueryState::Error(a), QueryState::Error(b)) => a == b,
    (QueryState::Success(a), QueryState::Success(_)) => {
      let cached = store.get(key).map(|entry| entry.value);
      serde_json::to_value(a).ok() == cached
    }
    _ => false,
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("stale_time", &self.stale_time)
      .finish_non_exhaustive()
  }
}
