//! In-memory ledger that produces blocks and finalizes receipts.
//!
//! Transactions are accepted into a mempool, applied when the next block is
//! mined, and reported final once they are `confirmations` blocks deep.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::confirm::{FinalitySource, Receipt, ReceiptStatus};
use crate::mutation::MutationError;

/// State change applied when a transaction is included. `Err` reverts it.
pub type Effect = Box<dyn FnOnce() -> Result<(), String> + Send>;

const WALLET_REJECTION: &str = "User rejected the request.";

struct PendingTx {
  receipt: Receipt,
  effect: Effect,
}

#[derive(Debug, Clone)]
struct Included {
  height: u64,
  /// False until the effect has run
  settled: bool,
  reverted: Option<String>,
}

#[derive(Default)]
struct LedgerState {
  height: u64,
  next_tx: u64,
  mempool: Vec<PendingTx>,
  included: HashMap<Receipt, Included>,
  halted: bool,
  wallet_rejects: bool,
}

pub struct Ledger {
  state: Mutex<LedgerState>,
  blocks: watch::Sender<u64>,
  block_time: Duration,
  confirmations: u64,
}

impl Ledger {
  pub fn new(block_time: Duration, confirmations: u64) -> Arc<Self> {
    let (blocks, _) = watch::channel(0);
    Arc::new(Self {
      state: Mutex::new(LedgerState::default()),
      blocks,
      block_time,
      confirmations: confirmations.max(1),
    })
  }

  fn lock(&self) -> MutexGuard<'_, LedgerState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Mine a block every `block_time` until the handle is aborted.
  pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
    let ledger = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(ledger.block_time);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        ledger.mine_block();
      }
    })
  }

  /// Include every pending transaction in a new block.
  ///
  /// Does nothing while halted. Returns the new height.
  pub fn mine_block(&self) -> u64 {
    let (height, batch) = {
      let mut state = self.lock();
      if state.halted {
        return state.height;
      }
      state.height += 1;
      let height = state.height;
      let batch = std::mem::take(&mut state.mempool);
      for tx in &batch {
        state.included.insert(
          tx.receipt.clone(),
          Included {
            height,
            settled: false,
            reverted: None,
          },
        );
      }
      (height, batch)
    };

    // Effects run outside the lock; they touch contract state, not the ledger
    let results: Vec<(Receipt, Option<String>)> = batch
      .into_iter()
      .map(|tx| {
        let reverted = (tx.effect)().err();
        (tx.receipt, reverted)
      })
      .collect();

    {
      let mut state = self.lock();
      for (receipt, reverted) in results {
        trace!(%receipt, height, ?reverted, "included");
        if let Some(included) = state.included.get_mut(&receipt) {
          included.settled = true;
          included.reverted = reverted;
        }
      }
    }
    debug!(height, "mined block");
    self.blocks.send_replace(height);
    height
  }

  /// Sign and broadcast a transaction.
  ///
  /// Fails with the wallet's rejection text when the wallet is set to reject.
  pub fn submit(&self, effect: Effect) -> Result<Receipt, String> {
    let mut state = self.lock();
    if state.wallet_rejects {
      return Err(WALLET_REJECTION.to_string());
    }
    state.next_tx += 1;
    let receipt = format!("0x{:064x}", state.next_tx);
    state.mempool.push(PendingTx {
      receipt: receipt.clone(),
      effect,
    });
    debug!(%receipt, "submitted");
    Ok(receipt)
  }

  /// Finality of `receipt` at the current height.
  pub fn receipt_status(&self, receipt: &Receipt) -> Result<ReceiptStatus, String> {
    let state = self.lock();
    if state.mempool.iter().any(|tx| &tx.receipt == receipt) {
      return Ok(ReceiptStatus::Pending);
    }
    let included = state
      .included
      .get(receipt)
      .ok_or_else(|| format!("unknown receipt {}", receipt))?;
    if !included.settled {
      return Ok(ReceiptStatus::Pending);
    }
    if let Some(reason) = &included.reverted {
      return Ok(ReceiptStatus::Failed(reason.clone()));
    }
    let depth = state.height + 1 - included.height;
    if depth >= self.confirmations {
      Ok(ReceiptStatus::Finalized)
    } else {
      Ok(ReceiptStatus::Pending)
    }
  }

  /// Resolve once `receipt` is final, following new blocks as they land.
  pub fn wait_for_finality(self: &Arc<Self>, receipt: Receipt) -> impl Future<Output = Result<(), MutationError>> + Send + 'static {
    let ledger = Arc::clone(self);
    let mut blocks = self.blocks.subscribe();
    async move {
      loop {
        match ledger.receipt_status(&receipt) {
          Ok(ReceiptStatus::Finalized) => return Ok(()),
          Ok(ReceiptStatus::Failed(reason)) => return Err(MutationError::ActionRejected(reason)),
          Ok(ReceiptStatus::Pending) => {}
          Err(e) => return Err(MutationError::ActionRejected(e)),
        }
        if blocks.changed().await.is_err() {
          return Err(MutationError::rejected("ledger stopped"));
        }
      }
    }
  }

  pub fn height(&self) -> u64 {
    self.lock().height
  }

  /// Stop producing blocks; pending receipts never finalize.
  pub fn set_halted(&self, halted: bool) {
    self.lock().halted = halted;
  }

  /// Make the wallet reject every signature request.
  pub fn set_wallet_rejects(&self, rejects: bool) {
    self.lock().wallet_rejects = rejects;
  }
}

impl FinalitySource for Ledger {
  fn status<'a>(&'a self, receipt: &'a Receipt) -> BoxFuture<'a, Result<ReceiptStatus, String>> {
    Box::pin(async move { self.receipt_status(receipt) })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn noop() -> Effect {
    Box::new(|| Ok(()))
  }

  #[test]
  fn test_receipt_finalizes_after_confirmations() {
    let ledger = Ledger::new(Duration::from_millis(100), 2);
    let receipt = ledger.submit(noop()).unwrap();
    assert_eq!(ledger.receipt_status(&receipt), Ok(ReceiptStatus::Pending));

    ledger.mine_block();
    assert_eq!(ledger.receipt_status(&receipt), Ok(ReceiptStatus::Pending));

    ledger.mine_block();
    assert_eq!(ledger.receipt_status(&receipt), Ok(ReceiptStatus::Finalized));
  }

  #[test]
  fn test_effect_runs_once_on_inclusion() {
    let ledger = Ledger::new(Duration::from_millis(100), 1);
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    ledger
      .submit(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
      }))
      .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 0);
    ledger.mine_block();
    ledger.mine_block();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_receipt_is_pending_while_its_block_is_mined() {
    let ledger = Ledger::new(Duration::from_millis(100), 1);
    let own: Arc<Mutex<Option<Receipt>>> = Arc::new(Mutex::new(None));
    let seen: Arc<Mutex<Option<Result<ReceiptStatus, String>>>> = Arc::new(Mutex::new(None));

    let (inner, slot, out) = (ledger.clone(), own.clone(), seen.clone());
    let receipt = ledger
      .submit(Box::new(move || {
        let receipt = slot.lock().unwrap().clone().unwrap();
        *out.lock().unwrap() = Some(inner.receipt_status(&receipt));
        Ok(())
      }))
      .unwrap();
    *own.lock().unwrap() = Some(receipt.clone());

    ledger.mine_block();
    assert_eq!(seen.lock().unwrap().clone(), Some(Ok(ReceiptStatus::Pending)));
    assert_eq!(ledger.receipt_status(&receipt), Ok(ReceiptStatus::Finalized));
  }

  #[test]
  fn test_reverted_effect_fails_receipt() {
    let ledger = Ledger::new(Duration::from_millis(100), 1);
    let receipt = ledger.submit(Box::new(|| Err("Game full".to_string()))).unwrap();
    ledger.mine_block();
    assert_eq!(
      ledger.receipt_status(&receipt),
      Ok(ReceiptStatus::Failed("Game full".to_string()))
    );
  }

  #[test]
  fn test_halted_ledger_keeps_receipts_pending() {
    let ledger = Ledger::new(Duration::from_millis(100), 1);
    let receipt = ledger.submit(noop()).unwrap();
    ledger.set_halted(true);
    ledger.mine_block();
    assert_eq!(ledger.height(), 0);
    assert_eq!(ledger.receipt_status(&receipt), Ok(ReceiptStatus::Pending));
  }

  #[test]
  fn test_wallet_rejection() {
    let ledger = Ledger::new(Duration::from_millis(100), 1);
    ledger.set_wallet_rejects(true);
    assert_eq!(ledger.submit(noop()), Err(WALLET_REJECTION.to_string()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_push_finality_follows_blocks() {
    let ledger = Ledger::new(Duration::from_millis(100), 3);
    let producer = ledger.start();
    let receipt = ledger.submit(noop()).unwrap();

    ledger.wait_for_finality(receipt).await.unwrap();
    assert!(ledger.height() >= 3);
    producer.abort();
  }
}
