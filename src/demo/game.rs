//! On-chain call sites of the game client.
//!
//! Each method builds one mutation over a [`Ledger`] transaction: whitelist
//! registration and votes confirm by polling receipts, joining follows new
//! blocks, and prize claims skip the optimistic step since the payout is
//! only known once the transaction lands.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::ledger::{Effect, Ledger};
use crate::cache::{CacheStore, KeyPart, QueryKey};
use crate::confirm::{Confirmation, FinalitySource};
use crate::mutation::{Mutation, MutationError, MutationExecutor, MutationOutcome, Submitted};

pub const PRIZE: u64 = 100;

/// Public view of one game.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameView {
  pub id: u64,
  pub players: Vec<String>,
  pub votes: BTreeMap<String, u32>,
  pub winner: Option<String>,
  pub prize_claimed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistStatus {
  pub registered: bool,
}

/// Contract state, mutated only by included transactions.
#[derive(Debug, Default)]
pub struct GameContract {
  whitelist: BTreeSet<String>,
  games: BTreeMap<u64, GameView>,
  balances: BTreeMap<String, u64>,
}

impl GameContract {
  pub fn open_game(&mut self, id: u64) {
    self.games.entry(id).or_insert_with(|| GameView {
      id,
      ..GameView::default()
    });
  }

  pub fn set_winner(&mut self, id: u64, winner: &str) {
    if let Some(game) = self.games.get_mut(&id) {
      game.winner = Some(winner.to_string());
    }
  }

  pub fn is_whitelisted(&self, address: &str) -> bool {
    self.whitelist.contains(address)
  }

  pub fn register(&mut self, address: &str) -> Result<(), String> {
    if !self.whitelist.insert(address.to_string()) {
      return Err("Already registered".to_string());
    }
    Ok(())
  }

  fn join(&mut self, id: u64, address: &str) -> Result<(), String> {
    if !self.whitelist.contains(address) {
      return Err("Not whitelisted".to_string());
    }
    let game = self.games.get_mut(&id).ok_or("Game not found")?;
    if game.players.iter().any(|p| p == address) {
      return Err("Already joined".to_string());
    }
    game.players.push(address.to_string());
    Ok(())
  }

  fn vote(&mut self, id: u64, address: &str, option: &str) -> Result<(), String> {
    let game = self.games.get_mut(&id).ok_or("Game not found")?;
    if !game.players.iter().any(|p| p == address) {
      return Err("Not a player".to_string());
    }
    *game.votes.entry(option.to_string()).or_insert(0) += 1;
    Ok(())
  }

  fn claim(&mut self, id: u64, address: &str) -> Result<(), String> {
    let game = self.games.get_mut(&id).ok_or("Game not found")?;
    if game.winner.as_deref() != Some(address) {
      return Err("Not the winner".to_string());
    }
    if game.prize_claimed {
      return Err("Already claimed".to_string());
    }
    game.prize_claimed = true;
    *self.balances.entry(address.to_string()).or_insert(0) += PRIZE;
    Ok(())
  }

  pub fn game(&self, id: u64) -> Option<GameView> {
    self.games.get(&id).cloned()
  }

  pub fn balance(&self, address: &str) -> u64 {
    self.balances.get(address).copied().unwrap_or(0)
  }
}

pub type SharedContract = Arc<Mutex<GameContract>>;

fn lock(contract: &SharedContract) -> MutexGuard<'_, GameContract> {
  contract.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn whitelist_key(address: &str) -> QueryKey {
  QueryKey::new("whitelist").with(KeyPart::map([("address", address)]))
}

pub fn game_key(id: u64) -> QueryKey {
  QueryKey::new("game").with(id as i64)
}

pub fn balance_key(address: &str) -> QueryKey {
  QueryKey::new("balance").with(address)
}

/// Wallet-connected client for one player address.
#[derive(Clone)]
pub struct GameClient {
  address: String,
  ledger: Arc<Ledger>,
  contract: SharedContract,
  executor: MutationExecutor,
}

impl GameClient {
  pub fn new(
    address: impl Into<String>,
    ledger: Arc<Ledger>,
    contract: SharedContract,
    executor: MutationExecutor,
  ) -> Self {
    Self {
      address: address.into(),
      ledger,
      contract,
      executor,
    }
  }

  pub fn address(&self) -> &str {
    &self.address
  }

  fn store(&self) -> &CacheStore {
    self.executor.store()
  }

  /// Register read fetchers so invalidation can refresh these views.
  pub fn register_fetchers(&self, game_id: u64) {
    let contract = self.contract.clone();
    let address = self.address.clone();
    self.store().register_fetcher(whitelist_key(&self.address), move || {
      let registered = lock(&contract).is_whitelisted(&address);
      async move { Ok(json!({ "registered": registered })) }
    });

    let contract = self.contract.clone();
    self.store().register_fetcher(game_key(game_id), move || {
      let game = lock(&contract).game(game_id);
      async move {
        let game = game.ok_or_else(|| format!("game {} not found", game_id))?;
        serde_json::to_value(game).map_err(|e| e.to_string())
      }
    });

    let contract = self.contract.clone();
    let address = self.address.clone();
    self.store().register_fetcher(balance_key(&self.address), move || {
      let balance = lock(&contract).balance(&address);
      async move { Ok(json!(balance)) }
    });
  }

  fn wallet(&self) -> Wallet {
    Wallet {
      ledger: self.ledger.clone(),
      contract: self.contract.clone(),
    }
  }

  fn finality(&self) -> Arc<dyn FinalitySource> {
    self.ledger.clone()
  }

  /// Register for the whitelist.
  ///
  /// The contract reverts with "Already registered" text, which the executor
  /// classifies as an idempotent conflict.
  pub async fn register_whitelist(&self) -> MutationOutcome<String> {
    let wallet = self.wallet();
    let address = self.address.clone();
    let source = self.finality();

    let mutation = Mutation::new("Register whitelist", async move {
      if wallet.contract().is_whitelisted(&address) {
        // Simulation catches the revert before anything is signed
        return Err(MutationError::rejected("execution reverted: Already registered"));
      }
      let receipt = wallet.send(move |c| c.register(&address))?;
      Ok(Submitted::confirm_with(receipt.clone(), Confirmation::poll(receipt, source)))
    })
    .affects(whitelist_key(&self.address))
    .optimistic(|snapshot| {
      snapshot.map_each(|_, _: WhitelistStatus| WhitelistStatus { registered: true })
    })
    .success_message("Registered for the whitelist");

    self.executor.execute(mutation).await
  }

  /// Join a game; confirmation follows new blocks.
  pub async fn join_game(&self, game_id: u64) -> MutationOutcome<String> {
    let wallet = self.wallet();
    let address = self.address.clone();

    let player = self.address.clone();
    let mutation = Mutation::new("Join game", async move {
      let joined = wallet
        .contract()
        .game(game_id)
        .is_some_and(|game| game.players.contains(&address));
      if joined {
        return Err(MutationError::IdempotentConflict("already joined".to_string()));
      }
      let receipt = wallet.send(move |c| c.join(game_id, &address))?;
      let finality = wallet.ledger.wait_for_finality(receipt.clone());
      Ok(Submitted::confirm_with(receipt, Confirmation::push(finality)))
    })
    .affects(game_key(game_id))
    .optimistic(move |snapshot| {
      snapshot.map_each(|_, mut game: GameView| {
        if !game.players.contains(&player) {
          game.players.push(player.clone());
        }
        game
      })
    })
    .success_message(format!("Joined game {}", game_id));

    self.executor.execute(mutation).await
  }

  pub async fn vote(&self, game_id: u64, option: &str) -> MutationOutcome<String> {
    let wallet = self.wallet();
    let address = self.address.clone();
    let choice = option.to_string();
    let source = self.finality();

    let tally = option.to_string();
    let mutation = Mutation::new("Vote", async move {
      let receipt = wallet.send(move |c| c.vote(game_id, &address, &choice))?;
      Ok(Submitted::confirm_with(receipt.clone(), Confirmation::poll(receipt, source)))
    })
    .affects(game_key(game_id))
    .optimistic(move |snapshot| {
      snapshot.map_each(|_, mut game: GameView| {
        *game.votes.entry(tally.clone()).or_insert(0) += 1;
        game
      })
    })
    .success_message(format!("Voted for {}", option));

    self.executor.execute(mutation).await
  }

  /// Claim the prize of a finished game. Nothing is written optimistically.
  pub async fn claim_prize(&self, game_id: u64) -> MutationOutcome<String> {
    let wallet = self.wallet();
    let address = self.address.clone();
    let source = self.finality();

    let mutation = Mutation::new("Claim prize", async move {
      let receipt = wallet.send(move |c| c.claim(game_id, &address))?;
      Ok(Submitted::confirm_with(receipt.clone(), Confirmation::poll(receipt, source)))
    })
    .affects(game_key(game_id))
    .affects(balance_key(&self.address))
    .success_message(format!("Claimed {} tokens", PRIZE));

    self.executor.execute(mutation).await
  }
}

/// Signs transactions for an action once it runs.
#[derive(Clone)]
struct Wallet {
  ledger: Arc<Ledger>,
  contract: SharedContract,
}

impl Wallet {
  fn contract(&self) -> MutexGuard<'_, GameContract> {
    lock(&self.contract)
  }

  /// Send a transaction whose effect is `apply` on the contract.
  fn send<F>(&self, apply: F) -> Result<String, MutationError>
  where
    F: FnOnce(&mut GameContract) -> Result<(), String> + Send + 'static,
  {
    let contract = self.contract.clone();
    let effect: Effect = Box::new(move || apply(&mut lock(&contract)));
    self.ledger.submit(effect).map_err(MutationError::ActionRejected)
  }
}

/// Seed `store` with the current contract view for `address`.
pub fn prime(store: &CacheStore, contract: &SharedContract, address: &str, game_id: u64) {
  let contract = lock(contract);
  let mut values: Vec<(QueryKey, Value)> = vec![
    (
      whitelist_key(address),
      json!({ "registered": contract.is_whitelisted(address) }),
    ),
    (balance_key(address), json!(contract.balance(address))),
  ];
  if let Some(value) = contract.game(game_id).and_then(|g| serde_json::to_value(g).ok()) {
    values.push((game_key(game_id), value));
  }
  store.set_many(values);
}
