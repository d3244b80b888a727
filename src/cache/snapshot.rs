//! Capture and restore of cache state for rolling back optimistic writes.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::entry::CacheEntry;
use super::key::QueryKey;
use super::store::CacheStore;

/// Immutable copy of every entry under a set of prefixes.
///
/// A snapshot is owned by one mutation run. Restoring it puts back exactly
/// the captured entries and removes keys created under the prefixes since
/// capture; entries outside the prefixes are left alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
  prefixes: Vec<QueryKey>,
  entries: Vec<(QueryKey, CacheEntry)>,
}

impl Snapshot {
  /// Read the current entries for every key under any of `prefixes`.
  pub fn capture(store: &CacheStore, prefixes: &[QueryKey]) -> Self {
    let mut entries = BTreeMap::new();
    for prefix in prefixes {
      entries.extend(store.entries_under(prefix));
    }
    Self {
      prefixes: prefixes.to_vec(),
      entries: entries.into_iter().collect(),
    }
  }

  /// Write the captured state back as one atomic batch.
  pub fn restore(&self, store: &CacheStore) {
    store.restore_entries(&self.prefixes, &self.entries);
  }

  pub fn prefixes(&self) -> &[QueryKey] {
    &self.prefixes
  }

  pub fn entries(&self) -> &[(QueryKey, CacheEntry)] {
    &self.entries
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn get(&self, key: &QueryKey) -> Option<&CacheEntry> {
    self.entries.iter().find(|(k, _)| k == key).map(|(_, e)| e)
  }

  pub fn value_as<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
    self.get(key)?.value_as()
  }

  /// Rewrite every captured entry whose value reads as `T`.
  ///
  /// Entries of another shape are skipped. The closure gets the key so call
  /// sites can adapt the update per view.
  pub fn map_each<T, F>(&self, mut f: F) -> Vec<(QueryKey, Value)>
  where
    T: DeserializeOwned + Serialize,
    F: FnMut(&QueryKey, T) -> T,
  {
    self
      .entries
      .iter()
      .filter_map(|(key, entry)| {
        let current: T = entry.value_as()?;
        let next = serde_json::to_value(f(key, current)).ok()?;
        Some((key.clone(), next))
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::QueryStatus;
  use serde_json::json;

  fn key(v: Value) -> QueryKey {
    QueryKey::from_json(v).unwrap()
  }

  #[test]
  fn test_capture_collects_all_prefixes() {
    let store = CacheStore::new();
    store.set(key(json!(["todos", "all"])), json!([1]), QueryStatus::Success);
    store.set(key(json!(["todos", "done"])), json!([]), QueryStatus::Success);
    store.set(key(json!(["stats"])), json!(1), QueryStatus::Success);
    store.set(key(json!(["user"])), json!("u"), QueryStatus::Success);

    let snapshot = Snapshot::capture(&store, &[key(json!(["todos"])), key(json!(["stats"]))]);

    assert_eq!(snapshot.len(), 3);
    assert!(snapshot.get(&key(json!(["user"]))).is_none());
    assert_eq!(snapshot.value_as::<Vec<u32>>(&key(json!(["todos", "all"]))), Some(vec![1]));
  }

  #[test]
  fn test_restore_is_exact_inverse() {
    let store = CacheStore::new();
    let list = key(json!(["todos"]));
    store.set(list.clone(), json!([{"id": "1", "title": "A"}]), QueryStatus::Success);
    let snapshot = Snapshot::capture(&store, &[list.clone()]);

    store.set(list.clone(), json!([]), QueryStatus::Success);
    store.set(key(json!(["todos", "extra"])), json!(true), QueryStatus::Success);
    snapshot.restore(&store);

    assert_eq!(Snapshot::capture(&store, &[list]), snapshot);
  }

  #[test]
  fn test_map_each_skips_other_shapes() {
    let store = CacheStore::new();
    store.set(key(json!(["todos", "a"])), json!([1, 2]), QueryStatus::Success);
    store.set(key(json!(["todos", "count"])), json!("two"), QueryStatus::Success);
    let snapshot = Snapshot::capture(&store, &[key(json!(["todos"]))]);

    let writes = snapshot.map_each::<Vec<u32>, _>(|_, mut list| {
      list.push(3);
      list
    });

    assert_eq!(writes, vec![(key(json!(["todos", "a"])), json!([1, 2, 3]))]);
  }

  #[test]
  fn test_snapshot_serializes() {
    let store = CacheStore::new();
    store.set(key(json!(["todos"])), json!([1]), QueryStatus::Success);
    let snapshot = Snapshot::capture(&store, &[key(json!(["todos"]))]);

    let text = serde_json::to_string(&snapshot).unwrap();
    let back: Snapshot = serde_json::from_str(&text).unwrap();
    assert_eq!(back, snapshot);
  }
}
