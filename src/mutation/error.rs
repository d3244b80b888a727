//! Failure kinds a mutation can end in.

use std::fmt;
use std::time::Duration;

/// Terminal failure of a mutation's action or its confirmation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
  /// The action failed: network error, wallet error, contract revert, or a
  /// response that reported failure
  #[error("{0}")]
  ActionRejected(String),
  /// No finalization signal within the poller's bound
  #[error("no confirmation after {:.1}s", .waited.as_secs_f64())]
  ConfirmationTimeout { waited: Duration },
  /// The user dismissed the wallet prompt
  #[error("cancelled by user")]
  UserCancelled,
  /// The desired end state already holds
  #[error("{0}")]
  IdempotentConflict(String),
}

impl MutationError {
  pub fn rejected(reason: impl fmt::Display) -> Self {
    MutationError::ActionRejected(reason.to_string())
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      MutationError::ActionRejected(_) => ErrorKind::ActionRejected,
      MutationError::ConfirmationTimeout { .. } => ErrorKind::ConfirmationTimeout,
      MutationError::UserCancelled => ErrorKind::UserCancelledAction,
      MutationError::IdempotentConflict(_) => ErrorKind::KnownIdempotentConflict,
    }
  }

  /// Message shown to the user for this failure.
  pub fn user_message(&self, mutation: &str) -> String {
    match self {
      MutationError::ActionRejected(reason) => format!("{} failed: {}", mutation, reason),
      MutationError::ConfirmationTimeout { waited } => format!(
        "{} was not confirmed within {:.1}s; it may still complete, check again shortly",
        mutation,
        waited.as_secs_f64()
      ),
      MutationError::UserCancelled => format!("{} cancelled", mutation),
      MutationError::IdempotentConflict(reason) => format!("{}: {}", mutation, reason),
    }
  }
}

/// Tag for every way a mutation run can be classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  ActionRejected,
  ConfirmationTimeout,
  UserCancelledAction,
  KnownIdempotentConflict,
  /// Not a failure: the mutation had no optimistic update to roll back
  OptimisticUpdateSkipped,
}

/// Maps free-text action failures onto structured kinds.
///
/// Action layers should return [`MutationError::IdempotentConflict`] or
/// [`MutationError::UserCancelled`] directly. Backends that only report text
/// go through this classifier, which matches configured case-insensitive
/// phrases against [`MutationError::ActionRejected`] messages.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
  conflict_patterns: Vec<String>,
  cancel_patterns: Vec<String>,
}

pub const DEFAULT_CONFLICT_PATTERNS: &[&str] = &[
  "already registered",
  "already whitelisted",
  "already joined",
  "already voted",
  "already claimed",
];

pub const DEFAULT_CANCEL_PATTERNS: &[&str] = &[
  "user rejected",
  "user denied",
  "rejected by user",
  "user cancelled",
];

impl Default for ErrorClassifier {
  fn default() -> Self {
    Self::new(
      DEFAULT_CONFLICT_PATTERNS.iter().copied(),
      DEFAULT_CANCEL_PATTERNS.iter().copied(),
    )
  }
}

impl ErrorClassifier {
  pub fn new<C, X, S, T>(conflicts: C, cancels: X) -> Self
  where
    C: IntoIterator<Item = S>,
    X: IntoIterator<Item = T>,
    S: AsRef<str>,
    T: AsRef<str>,
  {
    Self {
      conflict_patterns: conflicts
        .into_iter()
        .map(|p| p.as_ref().to_lowercase())
        .collect(),
      cancel_patterns: cancels
        .into_iter()
        .map(|p| p.as_ref().to_lowercase())
        .collect(),
    }
  }

  /// Classifier that leaves every error as reported.
  pub fn none() -> Self {
    Self {
      conflict_patterns: Vec::new(),
      cancel_patterns: Vec::new(),
    }
  }

  pub fn classify(&self, error: MutationError) -> MutationError {
    let message = match error {
      MutationError::ActionRejected(message) => message,
      other => return other,
    };
    let lowered = message.to_lowercase();
    if self.cancel_patterns.iter().any(|p| lowered.contains(p)) {
      MutationError::UserCancelled
    } else if self.conflict_patterns.iter().any(|p| lowered.contains(p)) {
      MutationError::IdempotentConflict(message)
    } else {
      MutationError::ActionRejected(message)
    }
  }
}
