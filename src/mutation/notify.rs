//! Notification sinks: where terminal mutation outcomes are reported.

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Kind of user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
  Success,
  Error,
  /// User dismissed the action; UI sinks usually show nothing
  Cancelled,
}

/// One terminal outcome, sent exactly once per mutation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub kind: NotificationKind,
  pub mutation: String,
  pub message: String,
}

impl Notification {
  pub fn success(mutation: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      kind: NotificationKind::Success,
      mutation: mutation.into(),
      message: message.into(),
    }
  }

  pub fn error(mutation: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      kind: NotificationKind::Error,
      mutation: mutation.into(),
      message: message.into(),
    }
  }

  pub fn cancelled(mutation: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      kind: NotificationKind::Cancelled,
      mutation: mutation.into(),
      message: message.into(),
    }
  }
}

/// Receiver of terminal mutation outcomes (toast surface, log, channel).
pub trait NotificationSink: Send + Sync {
  fn notify(&self, notification: Notification);
}

impl<S: NotificationSink + ?Sized> NotificationSink for Arc<S> {
  fn notify(&self, notification: Notification) {
    (**self).notify(notification)
  }
}

/// Delivers to both sinks, first one first.
impl<A: NotificationSink, B: NotificationSink> NotificationSink for (A, B) {
  fn notify(&self, notification: Notification) {
    self.0.notify(notification.clone());
    self.1.notify(notification);
  }
}

/// Writes notifications to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
  fn notify(&self, n: Notification) {
    match n.kind {
      NotificationKind::Error => warn!(mutation = %n.mutation, "{}", n.message),
      _ => info!(mutation = %n.mutation, kind = ?n.kind, "{}", n.message),
    }
  }
}

/// Forwards notifications to an event loop over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
  tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

impl NotificationSink for ChannelSink {
  fn notify(&self, notification: Notification) {
    // Receiver may have been dropped
    let _ = self.tx.send(notification);
  }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
  events: Mutex<Vec<Notification>>,
}

impl MemorySink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn events(&self) -> Vec<Notification> {
    self
      .events
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn count(&self, kind: NotificationKind) -> usize {
    self
      .events
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .filter(|n| n.kind == kind)
      .count()
  }
}

impl NotificationSink for MemorySink {
  fn notify(&self, notification: Notification) {
    self
      .events
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(notification);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_channel_sink_delivers_in_order() {
    let (sink, mut rx) = ChannelSink::new();
    sink.notify(Notification::success("Create todo", "created"));
    sink.notify(Notification::error("Delete todo", "boom"));

    assert_eq!(rx.recv().await.unwrap().kind, NotificationKind::Success);
    assert_eq!(rx.recv().await.unwrap().message, "boom");
  }

  #[test]
  fn test_channel_sink_ignores_dropped_receiver() {
    let (sink, rx) = ChannelSink::new();
    drop(rx);
    sink.notify(Notification::success("Vote", "ok"));
  }

  #[tokio::test]
  async fn test_paired_sinks_both_receive() {
    let memory = Arc::new(MemorySink::new());
    let (channel, mut rx) = ChannelSink::new();
    let sink = (LogSink, (memory.clone(), channel));
    sink.notify(Notification::error("Join game", "Game full"));

    assert_eq!(memory.count(NotificationKind::Error), 1);
    assert_eq!(rx.recv().await.unwrap().message, "Game full");
  }

  #[test]
  fn test_memory_sink_counts_by_kind() {
    let sink = Arc::new(MemorySink::new());
    let shared: Arc<dyn NotificationSink> = sink.clone();
    shared.notify(Notification::error("a", "x"));
    shared.notify(Notification::cancelled("b", "y"));
    shared.notify(Notification::error("c", "z"));

    assert_eq!(sink.count(NotificationKind::Error), 2);
    assert_eq!(sink.count(NotificationKind::Cancelled), 1);
    assert_eq!(sink.events().len(), 3);
  }
}
