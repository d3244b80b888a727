//! In-memory keyed store of query results with subscriptions and invalidation.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, warn};

use super::entry::{CacheEntry, CacheEvent, QueryStatus};
use super::key::QueryKey;

/// Callback invoked synchronously after a write or invalidation.
pub type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Authoritative source for a key, used to refetch after invalidation.
pub type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// A single change applied by [`CacheStore::apply`].
#[derive(Debug, Clone)]
pub enum CacheWrite {
  /// Store the entry exactly as given (timestamps included)
  Put(QueryKey, CacheEntry),
  Remove(QueryKey),
}

struct Subscriber {
  id: u64,
  key: QueryKey,
  listener: Listener,
}

#[derive(Default)]
struct StoreState {
  entries: BTreeMap<QueryKey, CacheEntry>,
  /// Kept in subscription order
  subscribers: Vec<Subscriber>,
  fetchers: HashMap<QueryKey, Fetcher>,
  persistable: Vec<QueryKey>,
  next_subscriber: u64,
}

impl StoreState {
  fn write_batch(&mut self, writes: Vec<CacheWrite>) -> Vec<CacheEvent> {
    let mut events = Vec::with_capacity(writes.len());
    for write in writes {
      match write {
        CacheWrite::Put(key, entry) => {
          self.entries.insert(key.clone(), entry);
          events.push(CacheEvent::Updated(key));
        }
        CacheWrite::Remove(key) => {
          if self.entries.remove(&key).is_some() {
            events.push(CacheEvent::Removed(key));
          }
        }
      }
    }
    events
  }

  fn dispatch_list(&self, events: Vec<CacheEvent>) -> Vec<(Listener, CacheEvent)> {
    let mut out = Vec::new();
    for event in events {
      for sub in &self.subscribers {
        if event.reaches(&sub.key) {
          out.push((Arc::clone(&sub.listener), event.clone()));
        }
      }
    }
    out
  }
}

/// Shared handle to the process-wide query cache.
///
/// Cloning is cheap; all clones see the same entries. Reads never fail: a
/// missing key is `None`. The lock is released before any listener runs, so
/// listeners may read from (or write to) the store.
#[derive(Clone, Default)]
pub struct CacheStore {
  state: Arc<Mutex<StoreState>>,
}

/// Keeps a listener registered; dropping it unsubscribes.
pub struct Subscription {
  state: Weak<Mutex<StoreState>>,
  id: u64,
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(state) = self.state.upgrade() {
      let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
      state.subscribers.retain(|s| s.id != self.id);
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription").field("id", &self.id).finish()
  }
}

impl CacheStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, StoreState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn notify(dispatch: Vec<(Listener, CacheEvent)>) {
    for (listener, event) in dispatch {
      listener(&event);
    }
  }

  pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
    self.lock().entries.get(key).cloned()
  }

  /// Typed read of a cached value.
  pub fn get_as<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
    let entry = self.get(key)?;
    match serde_json::from_value(entry.value) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(%key, error = %e, "cached value has unexpected shape");
        None
      }
    }
  }

  pub fn contains(&self, key: &QueryKey) -> bool {
    self.lock().entries.contains_key(key)
  }

  /// All entries whose key lies under `prefix`, in key order.
  pub fn entries_under(&self, prefix: &QueryKey) -> Vec<(QueryKey, CacheEntry)> {
    self
      .lock()
      .entries
      .range(prefix.clone()..)
      .take_while(|(k, _)| k.starts_with(prefix))
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect()
  }

  pub fn keys(&self) -> Vec<QueryKey> {
    self.lock().entries.keys().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().entries.is_empty()
  }

  /// Replace the entry for `key` and notify subscribers of it and its ancestors.
  pub fn set(&self, key: QueryKey, value: Value, status: QueryStatus) {
    self.apply(vec![CacheWrite::Put(key, CacheEntry::new(value, status))]);
  }

  /// Write several successful values; subscribers fire only after all land.
  pub fn set_many<I>(&self, values: I)
  where
    I: IntoIterator<Item = (QueryKey, Value)>,
  {
    let writes = values
      .into_iter()
      .map(|(key, value)| CacheWrite::Put(key, CacheEntry::new(value, QueryStatus::Success)))
      .collect();
    self.apply(writes);
  }

  pub fn remove(&self, key: &QueryKey) {
    self.apply(vec![CacheWrite::Remove(key.clone())]);
  }

  /// Apply a batch of writes under one lock, then notify.
  pub fn apply(&self, writes: Vec<CacheWrite>) {
    if writes.is_empty() {
      return;
    }
    let dispatch = {
      let mut state = self.lock();
      let events = state.write_batch(writes);
      state.dispatch_list(events)
    };
    Self::notify(dispatch);
  }

  /// Put back `entries` verbatim and drop any other key under `prefixes`.
  ///
  /// Keys outside `prefixes` are never touched. The whole restore happens
  /// under one lock.
  pub fn restore_entries(&self, prefixes: &[QueryKey], entries: &[(QueryKey, CacheEntry)]) {
    let captured: BTreeSet<&QueryKey> = entries.iter().map(|(k, _)| k).collect();
    let dispatch = {
      let mut state = self.lock();
      let mut writes: Vec<CacheWrite> = state
        .entries
        .keys()
        .filter(|k| k.is_under_any(prefixes) && !captured.contains(k))
        .cloned()
        .map(CacheWrite::Remove)
        .collect();
      writes.extend(
        entries
          .iter()
          .filter(|(k, _)| k.is_under_any(prefixes))
          .map(|(k, e)| CacheWrite::Put(k.clone(), e.clone())),
      );
      let events = state.write_batch(writes);
      state.dispatch_list(events)
    };
    Self::notify(dispatch);
  }

  /// Mark every entry under `prefix` stale and refetch the subscribed ones.
  ///
  /// Keys nobody subscribes to are left stale until next read. Returns the
  /// number of entries marked.
  pub fn invalidate(&self, prefix: &QueryKey) -> usize {
    let (marked, dispatch, refetch) = {
      let mut state = self.lock();
      let mut marked = 0;
      for (key, entry) in state.entries.iter_mut() {
        if key.starts_with(prefix) {
          entry.stale = true;
          marked += 1;
        }
      }
      let refetch: BTreeSet<QueryKey> = state
        .subscribers
        .iter()
        .filter(|s| s.key.starts_with(prefix) && state.fetchers.contains_key(&s.key))
        .map(|s| s.key.clone())
        .collect();
      let dispatch = state.dispatch_list(vec![CacheEvent::Invalidated(prefix.clone())]);
      (marked, dispatch, refetch)
    };
    debug!(%prefix, marked, refetching = refetch.len(), "invalidated");
    Self::notify(dispatch);
    for key in refetch {
      self.spawn_refetch(key);
    }
    marked
  }

  /// Whether the entry is stale or missing.
  pub fn is_stale(&self, key: &QueryKey) -> bool {
    self.get(key).map(|e| e.stale).unwrap_or(true)
  }

  /// Register a listener for `key` and everything beneath it.
  pub fn subscribe<F>(&self, key: QueryKey, listener: F) -> Subscription
  where
    F: Fn(&CacheEvent) + Send + Sync + 'static,
  {
    let mut state = self.lock();
    let id = state.next_subscriber;
    state.next_subscriber += 1;
    state.subscribers.push(Subscriber {
      id,
      key,
      listener: Arc::new(listener),
    });
    Subscription {
      state: Arc::downgrade(&self.state),
      id,
    }
  }

  pub fn subscriber_count(&self, key: &QueryKey) -> usize {
    self.lock().subscribers.iter().filter(|s| &s.key == key).count()
  }

  /// Register the authoritative fetcher for `key`.
  pub fn register_fetcher<F, Fut>(&self, key: QueryKey, fetcher: F)
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
  {
    let fetcher: Fetcher = Arc::new(move || Box::pin(fetcher()));
    self.lock().fetchers.insert(key, fetcher);
  }

  /// Flip `key` to pending and hand back its fetcher.
  ///
  /// Returns `None` when no fetcher is registered. The previous value is kept
  /// while the fetch runs.
  pub(crate) fn begin_fetch(&self, key: &QueryKey) -> Option<Fetcher> {
    let (fetcher, dispatch) = {
      let mut state = self.lock();
      let fetcher = Arc::clone(state.fetchers.get(key)?);
      let entry = state
        .entries
        .entry(key.clone())
        .or_insert_with(|| CacheEntry::new(Value::Null, QueryStatus::Pending));
      entry.status = QueryStatus::Pending;
      let dispatch = state.dispatch_list(vec![CacheEvent::Updated(key.clone())]);
      (fetcher, dispatch)
    };
    Self::notify(dispatch);
    Some(fetcher)
  }

  /// Await a fetch started by [`begin_fetch`](Self::begin_fetch) and record it.
  pub(crate) async fn finish_fetch(&self, key: QueryKey, fetcher: Fetcher) -> bool {
    match fetcher().await {
      Ok(value) => {
        self.set(key, value, QueryStatus::Success);
        true
      }
      Err(error) => {
        warn!(%key, %error, "refetch failed");
        let mut entry = self
          .get(&key)
          .unwrap_or_else(|| CacheEntry::new(Value::Null, QueryStatus::Error));
        entry.status = QueryStatus::Error;
        entry.error = Some(error);
        self.apply(vec![CacheWrite::Put(key, entry)]);
        false
      }
    }
  }

  /// Run the registered fetcher for `key` now. Returns whether it succeeded.
  pub async fn refetch(&self, key: &QueryKey) -> bool {
    match self.begin_fetch(key) {
      Some(fetcher) => self.finish_fetch(key.clone(), fetcher).await,
      None => false,
    }
  }

  fn spawn_refetch(&self, key: QueryKey) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      debug!(%key, "no runtime; refetch left to next read");
      return;
    };
    if let Some(fetcher) = self.begin_fetch(&key) {
      let store = self.clone();
      handle.spawn(async move {
        store.finish_fetch(key, fetcher).await;
      });
    }
  }

  /// Allow entries under `prefix` to be written to persistent storage.
  pub fn mark_persistable(&self, prefix: QueryKey) {
    let mut state = self.lock();
    if !state.persistable.contains(&prefix) {
      state.persistable.push(prefix);
    }
  }

  /// Persistence policy: only settled entries under a persistable prefix.
  pub fn is_persistable(&self, key: &QueryKey, entry: &CacheEntry) -> bool {
    entry.status == QueryStatus::Success && key.is_under_any(&self.lock().persistable)
  }

  pub fn persistable_entries(&self) -> Vec<(QueryKey, CacheEntry)> {
    let state = self.lock();
    state
      .entries
      .iter()
      .filter(|(k, e)| e.status == QueryStatus::Success && k.is_under_any(&state.persistable))
      .map(|(k, e)| (k.clone(), e.clone()))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn key(v: Value) -> QueryKey {
    QueryKey::from_json(v).unwrap()
  }

  fn recorder(store: &CacheStore, k: QueryKey) -> (Subscription, Arc<Mutex<Vec<CacheEvent>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = store.subscribe(k, move |e| sink.lock().unwrap().push(e.clone()));
    (sub, seen)
  }

  #[test]
  fn test_get_missing_is_none() {
    let store = CacheStore::new();
    assert!(store.get(&key(json!(["todos"]))).is_none());
    assert!(store.get_as::<Vec<u32>>(&key(json!(["todos"]))).is_none());
  }

  #[test]
  fn test_set_notifies_key_and_ancestors_only() {
    let store = CacheStore::new();
    let (_root, root_seen) = recorder(&store, key(json!(["todos"])));
    let (_page, page_seen) = recorder(&store, key(json!(["todos", {"page": 1}])));
    let (_other, other_seen) = recorder(&store, key(json!(["user"])));

    store.set(key(json!(["todos", {"page": 1}])), json!([1]), QueryStatus::Success);

    assert_eq!(root_seen.lock().unwrap().len(), 1);
    assert_eq!(page_seen.lock().unwrap().len(), 1);
    assert!(other_seen.lock().unwrap().is_empty());

    store.set(key(json!(["todos"])), json!([]), QueryStatus::Success);
    assert_eq!(root_seen.lock().unwrap().len(), 2);
    assert_eq!(page_seen.lock().unwrap().len(), 1);
  }

  #[test]
  fn test_set_many_is_atomic_for_subscribers() {
    let store = CacheStore::new();
    let a = key(json!(["todos", "a"]));
    let b = key(json!(["todos", "b"]));
    let observed = Arc::new(Mutex::new(Vec::new()));

    let reader = store.clone();
    let (a2, b2, obs) = (a.clone(), b.clone(), Arc::clone(&observed));
    let _sub = store.subscribe(key(json!(["todos"])), move |_| {
      obs
        .lock()
        .unwrap()
        .push((reader.get_as::<u32>(&a2), reader.get_as::<u32>(&b2)));
    });

    store.set_many(vec![(a, json!(1)), (b, json!(2))]);

    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), 2);
    // every callback already sees both writes
    assert!(observed.iter().all(|o| *o == (Some(1), Some(2))));
  }

  #[test]
  fn test_same_key_callbacks_fire_in_subscription_order() {
    let store = CacheStore::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut subs = Vec::new();
    for i in 0..3 {
      let order = Arc::clone(&order);
      subs.push(store.subscribe(key(json!(["k"])), move |_| order.lock().unwrap().push(i)));
    }
    store.set(key(json!(["k"])), json!(null), QueryStatus::Success);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
  }

  #[test]
  fn test_unsubscribe_on_drop() {
    let store = CacheStore::new();
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    let sub = store.subscribe(key(json!(["k"])), move |_| {
      c.fetch_add(1, Ordering::SeqCst);
    });
    store.set(key(json!(["k"])), json!(1), QueryStatus::Success);
    drop(sub);
    store.set(key(json!(["k"])), json!(2), QueryStatus::Success);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(store.subscriber_count(&key(json!(["k"]))), 0);
  }

  #[test]
  fn test_invalidate_marks_prefix_stale_without_runtime() {
    let store = CacheStore::new();
    store.set(key(json!(["todos", 1])), json!("a"), QueryStatus::Success);
    store.set(key(json!(["todos", 2])), json!("b"), QueryStatus::Success);
    store.set(key(json!(["user"])), json!("u"), QueryStatus::Success);

    assert_eq!(store.invalidate(&key(json!(["todos"]))), 2);

    assert!(store.is_stale(&key(json!(["todos", 1]))));
    assert!(store.is_stale(&key(json!(["todos", 2]))));
    assert!(!store.is_stale(&key(json!(["user"]))));
    // value survives invalidation
    assert_eq!(store.get_as::<String>(&key(json!(["todos", 1]))), Some("a".to_string()));
  }

  #[tokio::test]
  async fn test_invalidate_refetches_only_subscribed_keys() {
    let store = CacheStore::new();
    let watched = key(json!(["todos", "watched"]));
    let lazy = key(json!(["todos", "lazy"]));
    let calls = Arc::new(AtomicUsize::new(0));

    for k in [&watched, &lazy] {
      let calls = Arc::clone(&calls);
      store.register_fetcher(k.clone(), move || {
        let calls = Arc::clone(&calls);
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(json!("fresh"))
        }
      });
      store.set(k.clone(), json!("old"), QueryStatus::Success);
    }
    let _sub = store.subscribe(watched.clone(), |_| {});

    store.invalidate(&key(json!(["todos"])));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.get_as::<String>(&watched), Some("fresh".to_string()));
    assert!(!store.is_stale(&watched));
    assert_eq!(store.get_as::<String>(&lazy), Some("old".to_string()));
    assert!(store.is_stale(&lazy));
  }

  #[tokio::test]
  async fn test_failed_refetch_keeps_value() {
    let store = CacheStore::new();
    let k = key(json!(["todos"]));
    store.register_fetcher(k.clone(), || async { Err("offline".to_string()) });
    store.set(k.clone(), json!([1]), QueryStatus::Success);

    assert!(!store.refetch(&k).await);

    let entry = store.get(&k).unwrap();
    assert_eq!(entry.status, QueryStatus::Error);
    assert_eq!(entry.error.as_deref(), Some("offline"));
    assert_eq!(entry.value, json!([1]));
  }

  #[test]
  fn test_restore_entries_only_touches_prefixes() {
    let store = CacheStore::new();
    store.set(key(json!(["todos", 1])), json!("a"), QueryStatus::Success);
    let before = store.entries_under(&key(json!(["todos"])));

    store.set(key(json!(["todos", 1])), json!("changed"), QueryStatus::Success);
    store.set(key(json!(["todos", 2])), json!("new"), QueryStatus::Success);
    store.set(key(json!(["user"])), json!("u"), QueryStatus::Success);

    store.restore_entries(&[key(json!(["todos"]))], &before);

    assert_eq!(store.entries_under(&key(json!(["todos"]))), before);
    assert_eq!(store.get_as::<String>(&key(json!(["user"]))), Some("u".to_string()));
  }

  #[test]
  fn test_restore_lands_as_one_batch() {
    let store = CacheStore::new();
    let todos = key(json!(["todos"]));
    store.set(key(json!(["todos", 1])), json!("a"), QueryStatus::Success);
    let before = store.entries_under(&todos);
    store.set_many(vec![
      (key(json!(["todos", 1])), json!("b")),
      (key(json!(["todos", 2])), json!("c")),
      (key(json!(["todos", 3])), json!("d")),
    ]);

    let observed = Arc::new(Mutex::new(Vec::new()));
    let (reader, sink, prefix) = (store.clone(), observed.clone(), todos.clone());
    let _sub = store.subscribe(todos.clone(), move |_| {
      sink.lock().unwrap().push(reader.entries_under(&prefix));
    });

    store.restore_entries(&[todos.clone()], &before);

    let observed = observed.lock().unwrap();
    // Removals of keys 2 and 3 plus the put of key 1
    assert_eq!(observed.len(), 3);
    assert!(observed.iter().all(|seen| seen == &before));
  }

  #[test]
  fn test_persistable_policy() {
    let store = CacheStore::new();
    store.mark_persistable(key(json!(["todos"])));
    store.set(key(json!(["todos", 1])), json!("a"), QueryStatus::Success);
    store.set(key(json!(["todos", 2])), json!(null), QueryStatus::Pending);
    store.set(key(json!(["session"])), json!("secret"), QueryStatus::Success);

    let persisted: Vec<QueryKey> = store.persistable_entries().into_iter().map(|(k, _)| k).collect();
    assert_eq!(persisted, vec![key(json!(["todos", 1]))]);

    let session = store.get(&key(json!(["session"]))).unwrap();
    assert!(!store.is_persistable(&key(json!(["session"])), &session));
  }
}
