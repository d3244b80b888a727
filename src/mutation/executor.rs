//! Runs mutations: optimistic write, action, confirmation, then reconcile or
//! roll back.

use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use super::error::{ErrorClassifier, ErrorKind, MutationError};
use super::notify::{Notification, NotificationSink};
use crate::cache::{CacheStore, QueryKey, Snapshot};
use crate::confirm::{Confirmation, ConfirmationPoller, Finalized, PollConfig};

type Action<R> = BoxFuture<'static, Result<Submitted<R>, MutationError>>;
type OptimisticUpdate = Box<dyn FnOnce(&Snapshot) -> Vec<(QueryKey, Value)> + Send>;
type Verify<R> = Box<dyn Fn(&R) -> Result<(), MutationError> + Send + Sync>;

/// What an action hands back: its result and how to confirm it.
pub struct Submitted<R> {
  pub value: R,
  pub confirmation: Confirmation,
}

impl<R> Submitted<R> {
  /// Result is final as soon as the action resolves.
  pub fn immediate(value: R) -> Self {
    Self {
      value,
      confirmation: Confirmation::Immediate,
    }
  }

  pub fn confirm_with(value: R, confirmation: Confirmation) -> Self {
    Self {
      value,
      confirmation,
    }
  }
}

/// One state-changing operation, built per invocation and consumed by
/// [`MutationExecutor::execute`].
pub struct Mutation<R> {
  name: String,
  affected_keys: Vec<QueryKey>,
  action: Action<R>,
  optimistic: Option<OptimisticUpdate>,
  verify: Option<Verify<R>>,
  success_message: Option<String>,
}

impl<R: Send + 'static> Mutation<R> {
  pub fn new<F>(name: impl Into<String>, action: F) -> Self
  where
    F: Future<Output = Result<Submitted<R>, MutationError>> + Send + 'static,
  {
    Self {
      name: name.into(),
      affected_keys: Vec::new(),
      action: Box::pin(action),
      optimistic: None,
      verify: None,
      success_message: None,
    }
  }

  /// Declare a namespace this mutation writes to and invalidates on success.
  pub fn affects(mut self, prefix: QueryKey) -> Self {
    if !self.affected_keys.contains(&prefix) {
      self.affected_keys.push(prefix);
    }
    self
  }

  /// Pure reducer from the captured state to the optimistic writes.
  ///
  /// Writes outside the affected keys are dropped.
  pub fn optimistic<F>(mut self, update: F) -> Self
  where
    F: FnOnce(&Snapshot) -> Vec<(QueryKey, Value)> + Send + 'static,
  {
    self.optimistic = Some(Box::new(update));
    self
  }

  /// Check the action's result for a logical failure (e.g. `success: false`
  /// in an otherwise successful response).
  pub fn verify<F>(mut self, check: F) -> Self
  where
    F: Fn(&R) -> Result<(), MutationError> + Send + Sync + 'static,
  {
    self.verify = Some(Box::new(check));
    self
  }

  pub fn success_message(mut self, message: impl Into<String>) -> Self {
    self.success_message = Some(message.into());
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn affected_keys(&self) -> &[QueryKey] {
    &self.affected_keys
  }
}

/// Lifecycle of a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
  Idle,
  Pending,
  Confirming,
  Succeeded,
  Failed,
}

impl fmt::Display for MutationState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      MutationState::Idle => "idle",
      MutationState::Pending => "pending",
      MutationState::Confirming => "confirming",
      MutationState::Succeeded => "succeeded",
      MutationState::Failed => "failed",
    };
    f.write_str(s)
  }
}

/// Everything that happened during one execution.
#[derive(Debug)]
pub struct MutationOutcome<R> {
  /// `Succeeded` or `Failed`. An idempotent conflict counts as succeeded.
  pub state: MutationState,
  pub result: Result<R, MutationError>,
  pub optimistic_applied: bool,
  pub rolled_back: bool,
  /// Prefixes invalidated, once each
  pub invalidated: Vec<QueryKey>,
  pub finalized: Option<Finalized>,
  /// The single notification sent for this run
  pub notification: Notification,
}

impl<R> MutationOutcome<R> {
  pub fn is_success(&self) -> bool {
    self.state == MutationState::Succeeded
  }

  pub fn value(&self) -> Option<&R> {
    self.result.as_ref().ok()
  }

  pub fn error(&self) -> Option<&MutationError> {
    self.result.as_ref().err()
  }

  /// Kinds that describe this run; empty for a plain success with rollback
  /// support.
  pub fn kinds(&self) -> Vec<ErrorKind> {
    let mut kinds = Vec::new();
    if let Err(e) = &self.result {
      kinds.push(e.kind());
    }
    if !self.optimistic_applied {
      kinds.push(ErrorKind::OptimisticUpdateSkipped);
    }
    kinds
  }
}

/// Executes mutations against a shared cache store.
///
/// The executor is the only writer of optimistic state. Every run ends in
/// exactly one notification and never returns an error to the caller.
#[derive(Clone)]
pub struct MutationExecutor {
  store: CacheStore,
  sink: Arc<dyn NotificationSink>,
  poller: ConfirmationPoller,
  classifier: ErrorClassifier,
}

impl MutationExecutor {
  pub fn new(store: CacheStore, sink: Arc<dyn NotificationSink>) -> Self {
    Self {
      store,
      sink,
      poller: ConfirmationPoller::default(),
      classifier: ErrorClassifier::default(),
    }
  }

  pub fn with_poll_config(mut self, config: PollConfig) -> Self {
    self.poller = ConfirmationPoller::new(config);
    self
  }

  pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
    self.classifier = classifier;
    self
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  pub fn poll_config(&self) -> &PollConfig {
    self.poller.config()
  }

  /// Run `mutation` to completion on a background task.
  ///
  /// The run continues even if the handle is dropped; cache writes and the
  /// notification still land.
  pub fn spawn<R: Send + 'static>(&self, mutation: Mutation<R>) -> JoinHandle<MutationOutcome<R>> {
    let executor = self.clone();
    tokio::spawn(async move { executor.execute(mutation).await })
  }

  /// Run `mutation` through its whole lifecycle.
  pub async fn execute<R: Send + 'static>(&self, mutation: Mutation<R>) -> MutationOutcome<R> {
    let span = tracing::info_span!("mutation", name = %mutation.name);
    self.run(mutation).instrument(span).await
  }

  async fn run<R: Send + 'static>(&self, mutation: Mutation<R>) -> MutationOutcome<R> {
    let Mutation {
      name,
      affected_keys,
      action,
      optimistic,
      verify,
      success_message,
    } = mutation;

    let mut state = MutationState::Idle;
    transition(&mut state, MutationState::Pending);

    let snapshot = optimistic.map(|update| self.apply_optimistic(&affected_keys, update));
    let optimistic_applied = snapshot.is_some();

    let settled = match action.await {
      Ok(submitted) => {
        let checked = match &verify {
          Some(check) => check(&submitted.value),
          None => Ok(()),
        };
        match checked {
          Ok(()) => {
            transition(&mut state, MutationState::Confirming);
            self
              .poller
              .await_finalized(submitted.confirmation)
              .await
              .map(|finalized| (submitted.value, finalized))
          }
          Err(e) => Err(e),
        }
      }
      Err(e) => Err(e),
    };

    match settled.map_err(|e| self.classifier.classify(e)) {
      Ok((value, finalized)) => {
        transition(&mut state, MutationState::Succeeded);
        let invalidated = self.invalidate_all(&affected_keys);
        let message = success_message.unwrap_or_else(|| format!("{} confirmed", name));
        let notification = self.emit(Notification::success(&name, message));
        info!(attempts = finalized.attempts, "mutation succeeded");
        MutationOutcome {
          state,
          result: Ok(value),
          optimistic_applied,
          rolled_back: false,
          invalidated,
          finalized: Some(finalized),
          notification,
        }
      }
      Err(MutationError::IdempotentConflict(reason)) => {
        // Target state already holds: pull authoritative data, no error toast
        transition(&mut state, MutationState::Succeeded);
        let rolled_back = self.roll_back(snapshot.as_ref());
        let invalidated = self.invalidate_all(&affected_keys);
        let notification = self.emit(Notification::success(
          &name,
          MutationError::IdempotentConflict(reason.clone()).user_message(&name),
        ));
        info!(%reason, "mutation already applied");
        MutationOutcome {
          state,
          result: Err(MutationError::IdempotentConflict(reason)),
          optimistic_applied,
          rolled_back,
          invalidated,
          finalized: None,
          notification,
        }
      }
      Err(error) => {
        transition(&mut state, MutationState::Failed);
        let rolled_back = self.roll_back(snapshot.as_ref());
        let message = error.user_message(&name);
        let notification = match error {
          MutationError::UserCancelled => self.emit(Notification::cancelled(&name, message)),
          _ => self.emit(Notification::error(&name, message)),
        };
        warn!(%error, rolled_back, "mutation failed");
        MutationOutcome {
          state,
          result: Err(error),
          optimistic_applied,
          rolled_back,
          invalidated: Vec::new(),
          finalized: None,
          notification,
        }
      }
    }
  }

  fn apply_optimistic(&self, affected_keys: &[QueryKey], update: OptimisticUpdate) -> Snapshot {
    let snapshot = Snapshot::capture(&self.store, affected_keys);
    let (writes, stray): (Vec<_>, Vec<_>) = update(&snapshot)
      .into_iter()
      .partition(|(key, _)| key.is_under_any(affected_keys));
    for (key, _) in &stray {
      warn!(%key, "dropping optimistic write outside affected keys");
    }
    debug!(writes = writes.len(), captured = snapshot.len(), "applying optimistic update");
    self.store.set_many(writes);
    snapshot
  }

  fn roll_back(&self, snapshot: Option<&Snapshot>) -> bool {
    match snapshot {
      Some(snapshot) => {
        snapshot.restore(&self.store);
        debug!(entries = snapshot.len(), "restored snapshot");
        true
      }
      None => false,
    }
  }

  fn invalidate_all(&self, affected_keys: &[QueryKey]) -> Vec<QueryKey> {
    for key in affected_keys {
      self.store.invalidate(key);
    }
    affected_keys.to_vec()
  }

  fn emit(&self, notification: Notification) -> Notification {
    self.sink.notify(notification.clone());
    notification
  }
}

fn transition(state: &mut MutationState, next: MutationState) {
  debug!(from = %state, to = %next, "mutation transition");
  *state = next;
}
