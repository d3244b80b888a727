//! Mutations against the shared cache.
//!
//! A mutation snapshots the keys it declares, applies an optimistic write,
//! runs its action, waits for confirmation, and then either invalidates its
//! keys or restores the snapshot. Exactly one notification goes to the sink
//! per run.

mod error;
mod executor;
mod notify;

pub use error::{
  ErrorClassifier, ErrorKind, MutationError, DEFAULT_CANCEL_PATTERNS, DEFAULT_CONFLICT_PATTERNS,
};
pub use executor::{Mutation, MutationExecutor, MutationOutcome, MutationState, Submitted};
pub use notify::{
  ChannelSink, LogSink, MemorySink, Notification, NotificationKind, NotificationSink,
};
