//! Optimistic mutations and cache reconciliation.
//!
//! Mutations write optimistically into a shared [`cache::CacheStore`], wait
//! for their action to be confirmed, then either invalidate what they touched
//! or restore the snapshot taken beforehand.

pub mod cache;
pub mod config;
pub mod confirm;
pub mod demo;
pub mod logging;
pub mod mutation;
pub mod query;

pub use cache::{CacheStore, QueryKey, Snapshot};
pub use confirm::{Confirmation, ConfirmationPoller, FinalitySource, PollConfig};
pub use mutation::{Mutation, MutationError, MutationExecutor, MutationOutcome, Submitted};
pub use query::{Query, QueryState};
