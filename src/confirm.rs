//! Waiting for a submitted action to become final.
//!
//! Two backends are supported:
//! - a push-style future handed back by the action itself, which resolves only
//!   once the effect is final
//! - explicit polling of a [`FinalitySource`] with a bounded attempt budget
//!
//! Both are wrapped in the same hard timeout, so waiting always ends.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::mutation::MutationError;

/// Opaque handle identifying a submitted action (e.g. a transaction id).
pub type Receipt = String;

/// What a finality source reports for a receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptStatus {
  Pending,
  Finalized,
  /// Included but failed (reverted, dropped)
  Failed(String),
}

/// Something that can be asked whether a receipt is final.
pub trait FinalitySource: Send + Sync {
  /// Look up the receipt. `Err` is a transient lookup failure and is retried.
  fn status<'a>(&'a self, receipt: &'a Receipt) -> BoxFuture<'a, Result<ReceiptStatus, String>>;
}

/// How an action's effect will be confirmed.
pub enum Confirmation {
  /// Confirmed as soon as the action resolves (plain REST calls)
  Immediate,
  /// Future that resolves once the effect is final
  Push(BoxFuture<'static, Result<(), MutationError>>),
  /// Poll `source` for `receipt`
  Poll {
    receipt: Receipt,
    source: Arc<dyn FinalitySource>,
  },
}

impl Confirmation {
  pub fn push<F>(future: F) -> Self
  where
    F: Future<Output = Result<(), MutationError>> + Send + 'static,
  {
    Confirmation::Push(Box::pin(future))
  }

  pub fn poll(receipt: impl Into<Receipt>, source: Arc<dyn FinalitySource>) -> Self {
    Confirmation::Poll {
      receipt: receipt.into(),
      source,
    }
  }

  fn label(&self) -> &'static str {
    match self {
      Confirmation::Immediate => "immediate",
      Confirmation::Push(_) => "push",
      Confirmation::Poll { .. } => "poll",
    }
  }
}

impl std::fmt::Debug for Confirmation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Confirmation::Poll { receipt, .. } => {
        f.debug_struct("Poll").field("receipt", receipt).finish_non_exhaustive()
      }
      other => f.write_str(other.label()),
    }
  }
}

/// Bounds for waiting on a confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
  pub poll_interval: Duration,
  /// Hard limit on the whole wait, for every backend
  pub timeout: Duration,
  /// Status lookups before giving up on a polled receipt
  pub max_attempts: u32,
}

impl Default for PollConfig {
  fn default() -> Self {
    Self {
      poll_interval: Duration::from_secs(1),
      timeout: Duration::from_secs(60),
      max_attempts: 120,
    }
  }
}

/// Proof that a confirmation completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
  pub receipt: Option<Receipt>,
  /// Status lookups made (zero for immediate and push confirmations)
  pub attempts: u32,
  pub elapsed: Duration,
}

/// Awaits confirmations within the configured bounds.
#[derive(Debug, Clone, Default)]
pub struct ConfirmationPoller {
  config: PollConfig,
}

impl ConfirmationPoller {
  pub fn new(config: PollConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &PollConfig {
    &self.config
  }

  /// Wait for `confirmation` to finalize.
  ///
  /// Fails with [`MutationError::ConfirmationTimeout`] once the timeout or the
  /// attempt budget runs out, and with [`MutationError::ActionRejected`] when
  /// the receipt is reported failed.
  pub async fn await_finalized(&self, confirmation: Confirmation) -> Result<Finalized, MutationError> {
    let started = Instant::now();
    debug!(kind = confirmation.label(), "awaiting confirmation");

    match confirmation {
      Confirmation::Immediate => Ok(Finalized {
        receipt: None,
        attempts: 0,
        elapsed: Duration::ZERO,
      }),
      Confirmation::Push(future) => match time::timeout(self.config.timeout, future).await {
        Ok(Ok(())) => Ok(Finalized {
          receipt: None,
          attempts: 0,
          elapsed: started.elapsed(),
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(self.timed_out(started)),
      },
      Confirmation::Poll { receipt, source } => {
        let polling = self.poll_until_final(&receipt, source.as_ref(), started);
        match time::timeout(self.config.timeout, polling).await {
          Ok(Ok(attempts)) => Ok(Finalized {
            receipt: Some(receipt),
            attempts,
            elapsed: started.elapsed(),
          }),
          Ok(Err(e)) => Err(e),
          Err(_) => Err(self.timed_out(started)),
        }
      }
    }
  }

  async fn poll_until_final(
    &self,
    receipt: &Receipt,
    source: &dyn FinalitySource,
    started: Instant,
  ) -> Result<u32, MutationError> {
    let max_attempts = self.config.max_attempts.max(1);
    for attempt in 1..=max_attempts {
      match source.status(receipt).await {
        Ok(ReceiptStatus::Finalized) => {
          debug!(%receipt, attempt, "receipt finalized");
          return Ok(attempt);
        }
        Ok(ReceiptStatus::Failed(reason)) => {
          return Err(MutationError::ActionRejected(reason));
        }
        Ok(ReceiptStatus::Pending) => trace!(%receipt, attempt, "receipt pending"),
        Err(error) => warn!(%receipt, attempt, %error, "receipt lookup failed"),
      }
      if attempt < max_attempts {
        time::sleep(self.config.poll_interval).await;
      }
    }
    warn!(%receipt, max_attempts, "attempt budget exhausted");
    Err(MutationError::ConfirmationTimeout {
      waited: started.elapsed(),
    })
  }

  fn timed_out(&self, started: Instant) -> MutationError {
    warn!(timeout = ?self.config.timeout, "confirmation timed out");
    MutationError::ConfirmationTimeout {
      waited: started.elapsed(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Mutex;

  /// Reports pending a fixed number of times, then the scripted final status.
  struct Scripted {
    pending_for: u32,
    last: ReceiptStatus,
    lookups: AtomicU32,
    flaky: Mutex<Vec<bool>>,
  }

  impl Scripted {
    fn new(pending_for: u32, last: ReceiptStatus) -> Arc<Self> {
      Arc::new(Self {
        pending_for,
        last,
        lookups: AtomicU32::new(0),
        flaky: Mutex::new(Vec::new()),
      })
    }
  }

  impl FinalitySource for Scripted {
    fn status<'a>(&'a self, _receipt: &'a Receipt) -> BoxFuture<'a, Result<ReceiptStatus, String>> {
      Box::pin(async move {
        if self.flaky.lock().unwrap().pop().unwrap_or(false) {
          return Err("rpc unavailable".to_string());
        }
        let n = self.lookups.fetch_add(1, Ordering::SeqCst);
        if n < self.pending_for {
          Ok(ReceiptStatus::Pending)
        } else {
          Ok(self.last.clone())
        }
      })
    }
  }

  fn poller(interval_ms: u64, timeout_ms: u64, max_attempts: u32) -> ConfirmationPoller {
    ConfirmationPoller::new(PollConfig {
      poll_interval: Duration::from_millis(interval_ms),
      timeout: Duration::from_millis(timeout_ms),
      max_attempts,
    })
  }

  #[tokio::test]
  async fn test_immediate_confirms_without_lookups() {
    let finalized = poller(10, 100, 3)
      .await_finalized(Confirmation::Immediate)
      .await
      .unwrap();
    assert_eq!(finalized.attempts, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_poll_until_finalized() {
    let source = Scripted::new(2, ReceiptStatus::Finalized);
    let finalized = poller(100, 5_000, 10)
      .await_finalized(Confirmation::poll("0x01", source.clone()))
      .await
      .unwrap();

    assert_eq!(finalized.attempts, 3);
    assert_eq!(finalized.receipt.as_deref(), Some("0x01"));
    assert!(finalized.elapsed >= Duration::from_millis(200));
    assert!(finalized.elapsed < Duration::from_millis(300));
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_receipt_is_rejection() {
    let source = Scripted::new(1, ReceiptStatus::Failed("reverted".to_string()));
    let err = poller(100, 5_000, 10)
      .await_finalized(Confirmation::poll("0x02", source))
      .await
      .unwrap_err();
    assert_eq!(err, MutationError::ActionRejected("reverted".to_string()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_lookup_errors_are_retried() {
    let source = Scripted::new(0, ReceiptStatus::Finalized);
    source.flaky.lock().unwrap().extend([true, true]);
    let finalized = poller(100, 5_000, 10)
      .await_finalized(Confirmation::poll("0x03", source))
      .await
      .unwrap();
    assert_eq!(finalized.attempts, 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_attempt_budget_ends_in_timeout() {
    let source = Scripted::new(u32::MAX, ReceiptStatus::Finalized);
    let err = poller(100, 60_000, 4)
      .await_finalized(Confirmation::poll("0x04", source.clone()))
      .await
      .unwrap_err();

    assert!(matches!(err, MutationError::ConfirmationTimeout { .. }));
    assert_eq!(source.lookups.load(Ordering::SeqCst), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_never_final_receipt_rejects_at_timeout() {
    let source = Scripted::new(u32::MAX, ReceiptStatus::Finalized);
    let started = Instant::now();

    let err = poller(250, 2_000, u32::MAX)
      .await_finalized(Confirmation::poll("0x05", source))
      .await
      .unwrap_err();

    let waited = started.elapsed();
    assert!(matches!(err, MutationError::ConfirmationTimeout { .. }));
    assert!(waited >= Duration::from_millis(2_000));
    assert!(waited <= Duration::from_millis(2_010));
  }

  #[tokio::test(start_paused = true)]
  async fn test_push_future_is_bounded() {
    let started = Instant::now();
    let err = poller(100, 2_000, 1)
      .await_finalized(Confirmation::push(futures::future::pending()))
      .await
      .unwrap_err();

    assert!(matches!(err, MutationError::ConfirmationTimeout { waited } if waited >= Duration::from_millis(2_000)));
    assert!(started.elapsed() <= Duration::from_millis(2_010));
  }

  #[tokio::test]
  async fn test_push_future_error_passes_through() {
    let err = poller(10, 1_000, 1)
      .await_finalized(Confirmation::push(async { Err(MutationError::UserCancelled) }))
      .await
      .unwrap_err();
    assert_eq!(err, MutationError::UserCancelled);
  }
}
