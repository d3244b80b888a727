//! Optimistic todo CRUD over an in-memory REST backend.
//!
//! Lists are cached per filter under `["todos", {"filter": ...}]`; every write
//! declares the whole `["todos"]` namespace and adapts the optimistic update
//! to each cached view.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::cache::{CacheLayer, CacheStorage, KeyPart, QueryKey};
use crate::mutation::{Mutation, MutationError, MutationExecutor, MutationOutcome, Submitted};
use crate::query::Query;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
  pub id: String,
  pub title: String,
  pub completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoFilter {
  All,
  Active,
  Completed,
}

impl TodoFilter {
  pub const ALL: [TodoFilter; 3] = [TodoFilter::All, TodoFilter::Active, TodoFilter::Completed];

  pub fn as_str(&self) -> &'static str {
    match self {
      TodoFilter::All => "all",
      TodoFilter::Active => "active",
      TodoFilter::Completed => "completed",
    }
  }

  pub fn matches(&self, todo: &Todo) -> bool {
    match self {
      TodoFilter::All => true,
      TodoFilter::Active => !todo.completed,
      TodoFilter::Completed => todo.completed,
    }
  }
}

impl FromStr for TodoFilter {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "all" => Ok(TodoFilter::All),
      "active" => Ok(TodoFilter::Active),
      "completed" => Ok(TodoFilter::Completed),
      other => Err(format!("unknown filter {}", other)),
    }
  }
}

pub fn todos_key() -> QueryKey {
  QueryKey::new("todos")
}

pub fn list_key(filter: TodoFilter) -> QueryKey {
  todos_key().with(KeyPart::map([("filter", filter.as_str())]))
}

/// Filter of a cached list view, read back from its key.
fn view_filter(key: &QueryKey) -> Option<TodoFilter> {
  key.parts().get(1)?.field("filter")?.as_str()?.parse().ok()
}

/// Response envelope; `success: false` is a logical failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
  pub success: bool,
  pub data: Option<T>,
  pub message: Option<String>,
}

impl<T> ApiResponse<T> {
  fn ok(data: T) -> Self {
    Self {
      success: true,
      data: Some(data),
      message: None,
    }
  }

  fn failed(message: impl Into<String>) -> Self {
    Self {
      success: false,
      data: None,
      message: Some(message.into()),
    }
  }

  pub fn check(&self) -> Result<(), MutationError> {
    if self.success {
      Ok(())
    } else {
      Err(MutationError::rejected(
        self.message.as_deref().unwrap_or("request failed"),
      ))
    }
  }
}

/// Patch for an existing todo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoPatch {
  pub title: Option<String>,
  pub completed: Option<bool>,
}

impl TodoPatch {
  fn apply(&self, todo: &mut Todo) {
    if let Some(title) = &self.title {
      todo.title = title.clone();
    }
    if let Some(completed) = self.completed {
      todo.completed = completed;
    }
  }
}

/// In-memory REST backend with configurable latency and failures.
#[derive(Debug)]
pub struct TodoBackend {
  todos: Mutex<Vec<Todo>>,
  next_id: AtomicU64,
  latency: Duration,
  offline: AtomicBool,
}

impl TodoBackend {
  pub fn new(latency: Duration) -> Arc<Self> {
    Arc::new(Self {
      todos: Mutex::new(Vec::new()),
      next_id: AtomicU64::new(1),
      latency,
      offline: AtomicBool::new(false),
    })
  }

  fn lock(&self) -> MutexGuard<'_, Vec<Todo>> {
    self.todos.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn seed<I, S>(&self, titles: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let mut todos = self.lock();
    for title in titles {
      let id = self.next_id.fetch_add(1, Ordering::SeqCst);
      todos.insert(
        0,
        Todo {
          id: id.to_string(),
          title: title.into(),
          completed: false,
        },
      );
    }
  }

  /// Fail every request with a network error.
  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  async fn roundtrip(&self) -> Result<(), String> {
    tokio::time::sleep(self.latency).await;
    if self.offline.load(Ordering::SeqCst) {
      return Err("network error: connection refused".to_string());
    }
    Ok(())
  }

  pub fn snapshot(&self) -> Vec<Todo> {
    self.lock().clone()
  }

  pub async fn list(&self, filter: TodoFilter) -> Result<Vec<Todo>, String> {
    self.roundtrip().await?;
    Ok(self.lock().iter().filter(|t| filter.matches(t)).cloned().collect())
  }

  pub async fn create(&self, title: String) -> Result<ApiResponse<Todo>, String> {
    self.roundtrip().await?;
    if title.trim().is_empty() {
      return Ok(ApiResponse::failed("title is required"));
    }
    let todo = Todo {
      id: self.next_id.fetch_add(1, Ordering::SeqCst).to_string(),
      title,
      completed: false,
    };
    self.lock().insert(0, todo.clone());
    Ok(ApiResponse::ok(todo))
  }

  pub async fn update(&self, id: String, patch: TodoPatch) -> Result<ApiResponse<Todo>, String> {
    self.roundtrip().await?;
    let mut todos = self.lock();
    match todos.iter_mut().find(|t| t.id == id) {
      Some(todo) => {
        patch.apply(todo);
        Ok(ApiResponse::ok(todo.clone()))
      }
      None => Ok(ApiResponse::failed(format!("todo {} not found", id))),
    }
  }

  pub async fn delete(&self, id: String) -> Result<ApiResponse<()>, String> {
    self.roundtrip().await?;
    let mut todos = self.lock();
    let before = todos.len();
    todos.retain(|t| t.id != id);
    if todos.len() == before {
      return Ok(ApiResponse::failed(format!("todo {} not found", id)));
    }
    Ok(ApiResponse::ok(()))
  }
}

/// Todo client: cache-first reads and optimistic writes.
pub struct TodoApi<S: CacheStorage> {
  backend: Arc<TodoBackend>,
  cache: CacheLayer<S>,
  executor: MutationExecutor,
  temp_ids: Arc<AtomicU64>,
}

impl<S: CacheStorage> Clone for TodoApi<S> {
  fn clone(&self) -> Self {
    Self {
      backend: Arc::clone(&self.backend),
      cache: self.cache.clone(),
      executor: self.executor.clone(),
      temp_ids: Arc::clone(&self.temp_ids),
    }
  }
}

impl<S: CacheStorage> TodoApi<S> {
  pub fn new(backend: Arc<TodoBackend>, cache: CacheLayer<S>, executor: MutationExecutor) -> Self {
    Self {
      backend,
      cache,
      executor,
      temp_ids: Arc::new(AtomicU64::new(1)),
    }
  }

  /// Read one filtered list through the cache.
  pub async fn list(&self, filter: TodoFilter) -> color_eyre::Result<Vec<Todo>> {
    let backend = self.backend.clone();
    let result = self
      .cache
      .fetch(&list_key(filter), || async move {
        backend.list(filter).await.map_err(|e| color_eyre::eyre::eyre!(e))
      })
      .await?;
    debug!(filter = filter.as_str(), source = ?result.source, "listed todos");
    Ok(result.data)
  }

  /// Observe one filtered list; it refetches whenever a write lands.
  pub fn watch(&self, filter: TodoFilter) -> Query<Vec<Todo>> {
    let backend = self.backend.clone();
    Query::new(self.cache.store().clone(), list_key(filter), move || {
      let backend = backend.clone();
      async move { backend.list(filter).await }
    })
  }

  pub async fn create(&self, title: &str) -> MutationOutcome<ApiResponse<Todo>> {
    let temp = Todo {
      id: format!("temp-{}", self.temp_ids.fetch_add(1, Ordering::SeqCst)),
      title: title.to_string(),
      completed: false,
    };
    let backend = self.backend.clone();
    let title = title.to_string();

    let mutation = Mutation::new("Create todo", async move {
      let response = backend.create(title).await.map_err(MutationError::ActionRejected)?;
      Ok(Submitted::immediate(response))
    })
    .affects(todos_key())
    .optimistic(move |snapshot| {
      snapshot.map_each(|key, mut list: Vec<Todo>| {
        if view_filter(key).is_some_and(|f| f.matches(&temp)) {
          list.insert(0, temp.clone());
        }
        list
      })
    })
    .verify(ApiResponse::check)
    .success_message("Todo created");

    self.executor.execute(mutation).await
  }

  pub async fn update(&self, id: &str, patch: TodoPatch) -> MutationOutcome<ApiResponse<Todo>> {
    let backend = self.backend.clone();
    let target = id.to_string();
    let request = (id.to_string(), patch.clone());

    let mutation = Mutation::new("Update todo", async move {
      let (id, patch) = request;
      let response = backend.update(id, patch).await.map_err(MutationError::ActionRejected)?;
      Ok(Submitted::immediate(response))
    })
    .affects(todos_key())
    .optimistic(move |snapshot| {
      // The patched todo may move between views; take it from any view
      let patched = snapshot.entries().iter().find_map(|(_, entry)| {
        let list: Vec<Todo> = entry.value_as()?;
        let mut todo = list.into_iter().find(|t| t.id == target)?;
        patch.apply(&mut todo);
        Some(todo)
      });
      snapshot.map_each(|key, list: Vec<Todo>| {
        let Some(patched) = &patched else {
          return list;
        };
        let keep = view_filter(key).is_some_and(|f| f.matches(patched));
        let mut next: Vec<Todo> = list
          .into_iter()
          .filter_map(|t| match t.id == patched.id {
            true if keep => Some(patched.clone()),
            true => None,
            false => Some(t),
          })
          .collect();
        if keep && !next.iter().any(|t| t.id == patched.id) {
          next.insert(0, patched.clone());
        }
        next
      })
    })
    .verify(ApiResponse::check)
    .success_message("Todo updated");

    self.executor.execute(mutation).await
  }

  pub async fn delete(&self, id: &str) -> MutationOutcome<ApiResponse<()>> {
    let backend = self.backend.clone();
    let target = id.to_string();
    let request = id.to_string();

    let mutation = Mutation::new("Delete todo", async move {
      let response = backend.delete(request).await.map_err(MutationError::ActionRejected)?;
      Ok(Submitted::immediate(response))
    })
    .affects(todos_key())
    .optimistic(move |snapshot| {
      snapshot.map_each(|_, mut list: Vec<Todo>| {
        list.retain(|t| t.id != target);
        list
      })
    })
    .verify(ApiResponse::check)
    .success_message("Todo deleted");

    self.executor.execute(mutation).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStore, NoopStorage};
  use crate::mutation::{MemorySink, NotificationKind};

  struct Harness {
    backend: Arc<TodoBackend>,
    store: CacheStore,
    sink: Arc<MemorySink>,
    api: TodoApi<NoopStorage>,
  }

  fn harness() -> Harness {
    let backend = TodoBackend::new(Duration::from_millis(5));
    backend.seed(["write docs", "ship it"]);
    let store = CacheStore::new();
    let sink = Arc::new(MemorySink::new());
    let executor = MutationExecutor::new(store.clone(), sink.clone());
    let api = TodoApi::new(backend.clone(), CacheLayer::new(store.clone(), NoopStorage, "test"), executor);
    Harness {
      backend,
      store,
      sink,
      api,
    }
  }

  fn ids(todos: &[Todo]) -> Vec<&str> {
    todos.iter().map(|t| t.id.as_str()).collect()
  }

  async fn load_views(h: &Harness) {
    for filter in TodoFilter::ALL {
      h.api.list(filter).await.unwrap();
    }
  }

  fn cached(h: &Harness, filter: TodoFilter) -> Vec<Todo> {
    h.store.get_as(&list_key(filter)).unwrap()
  }

  #[test]
  fn test_view_filter_reads_key() {
    assert_eq!(view_filter(&list_key(TodoFilter::Active)), Some(TodoFilter::Active));
    assert_eq!(view_filter(&todos_key()), None);
  }

  #[tokio::test]
  async fn test_create_inserts_into_matching_views() {
    let h = harness();
    load_views(&h).await;
    h.backend.set_offline(true);

    let api = h.api.clone();
    let pending = tokio::spawn(async move { api.create("buy milk").await });
    tokio::task::yield_now().await;

    assert_eq!(ids(&cached(&h, TodoFilter::All))[0], "temp-1");
    assert_eq!(ids(&cached(&h, TodoFilter::Active))[0], "temp-1");
    assert!(cached(&h, TodoFilter::Completed).is_empty());

    let outcome = pending.await.unwrap();
    assert!(!outcome.is_success());
    assert_eq!(ids(&cached(&h, TodoFilter::All)), vec!["2", "1"]);
  }

  #[tokio::test]
  async fn test_create_success_refetches_watched_view() {
    let h = harness();
    load_views(&h).await;
    let mut all = h.api.watch(TodoFilter::All);

    let outcome = h.api.create("buy milk").await;
    assert!(outcome.is_success());
    assert_eq!(outcome.value().and_then(|r| r.data.as_ref()).map(|t| t.id.as_str()), Some("3"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    all.poll();
    assert_eq!(ids(all.data().unwrap()), vec!["3", "2", "1"]);
    assert_eq!(h.sink.count(NotificationKind::Success), 1);
  }

  #[tokio::test]
  async fn test_empty_title_is_logical_failure() {
    let h = harness();
    load_views(&h).await;
    let before = h.store.entries_under(&todos_key());

    let outcome = h.api.create("  ").await;

    assert!(outcome.rolled_back);
    assert_eq!(h.store.entries_under(&todos_key()), before);
    assert_eq!(h.sink.events()[0].message, "Create todo failed: title is required");
  }

  #[tokio::test]
  async fn test_completing_moves_between_views() {
    let h = harness();
    load_views(&h).await;
    h.backend.set_offline(true);

    let api = h.api.clone();
    let pending = tokio::spawn(async move {
      api
        .update(
          "1",
          TodoPatch {
            completed: Some(true),
            ..TodoPatch::default()
          },
        )
        .await
    });
    tokio::task::yield_now().await;

    assert_eq!(ids(&cached(&h, TodoFilter::Active)), vec!["2"]);
    assert_eq!(ids(&cached(&h, TodoFilter::Completed)), vec!["1"]);
    assert!(cached(&h, TodoFilter::All).iter().any(|t| t.id == "1" && t.completed));

    pending.await.unwrap();
    assert_eq!(ids(&cached(&h, TodoFilter::Active)), vec!["2", "1"]);
    assert!(cached(&h, TodoFilter::Completed).is_empty());
  }

  #[tokio::test]
  async fn test_delete_removes_from_every_view() {
    let h = harness();
    load_views(&h).await;

    let outcome = h.api.delete("2").await;

    assert!(outcome.is_success());
    assert_eq!(ids(&cached(&h, TodoFilter::All)), vec!["1"]);
    assert_eq!(ids(&cached(&h, TodoFilter::Active)), vec!["1"]);
    assert!(h.store.is_stale(&list_key(TodoFilter::All)));
    assert_eq!(ids(&h.backend.snapshot()), vec!["1"]);
  }

  #[tokio::test]
  async fn test_delete_unknown_rolls_back() {
    let h = harness();
    load_views(&h).await;

    let outcome = h.api.delete("99").await;

    assert!(outcome.rolled_back);
    assert_eq!(h.sink.count(NotificationKind::Error), 1);
  }
}
