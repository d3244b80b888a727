//! Cache entries and the events subscribers receive.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::key::QueryKey;

/// Fetch status of a cached query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
  Idle,
  Pending,
  Success,
  Error,
}

impl QueryStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      QueryStatus::Idle => "idle",
      QueryStatus::Pending => "pending",
      QueryStatus::Success => "success",
      QueryStatus::Error => "error",
    }
  }
}

impl fmt::Display for QueryStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for QueryStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "idle" => Ok(QueryStatus::Idle),
      "pending" => Ok(QueryStatus::Pending),
      "success" => Ok(QueryStatus::Success),
      "error" => Ok(QueryStatus::Error),
      other => Err(format!("unknown query status '{}'", other)),
    }
  }
}

/// A single cached query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub value: Value,
  pub status: QueryStatus,
  pub updated_at: DateTime<Utc>,
  /// Set by invalidation, cleared by the next write
  pub stale: bool,
  /// Last fetch error, kept alongside the previous value
  pub error: Option<String>,
}

impl CacheEntry {
  pub fn new(value: Value, status: QueryStatus) -> Self {
    Self {
      value,
      status,
      updated_at: Utc::now(),
      stale: false,
      error: None,
    }
  }

  /// Deserialize the payload into a concrete type.
  pub fn value_as<T: DeserializeOwned>(&self) -> Option<T> {
    serde_json::from_value(self.value.clone()).ok()
  }
}

/// Change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
  /// Entry written (set, optimistic write, rollback, refetch)
  Updated(QueryKey),
  /// Entry dropped (rollback of a key that did not exist before)
  Removed(QueryKey),
  /// Every entry under the prefix was marked stale
  Invalidated(QueryKey),
}

impl CacheEvent {
  pub fn key(&self) -> &QueryKey {
    match self {
      CacheEvent::Updated(k) | CacheEvent::Removed(k) | CacheEvent::Invalidated(k) => k,
    }
  }

  /// Whether a subscriber on `subscribed` should hear about this event.
  pub(crate) fn reaches(&self, subscribed: &QueryKey) -> bool {
    match self {
      CacheEvent::Updated(k) | CacheEvent::Removed(k) => k.starts_with(subscribed),
      CacheEvent::Invalidated(prefix) => prefix.is_related(subscribed),
    }
  }
}
