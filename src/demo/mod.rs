//! Demo flows driven from the command line.
//!
//! Each flow wires real call sites (todo CRUD, whitelist registration, the
//! game) to one shared cache and prints the notifications they produce.

pub mod game;
pub mod ledger;
pub mod todos;

use color_eyre::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::cache::{CacheLayer, CacheStorage, CacheStore, NoopStorage, SqliteStorage};
use crate::config::Config;
use crate::mutation::{ChannelSink, LogSink, MutationExecutor, MutationOutcome, Notification, NotificationKind};
use game::{GameClient, GameContract, SharedContract};
use ledger::Ledger;
use todos::{TodoApi, TodoBackend, TodoFilter, TodoPatch};

pub type DynStorage = Box<dyn CacheStorage>;

const PLAYER: &str = "0x5eed00000000000000000000000000000000b0b";
const GAME_ID: u64 = 1;

/// Shared cache, executor and notification feed for one run.
pub struct DemoContext {
  pub layer: CacheLayer<DynStorage>,
  pub executor: MutationExecutor,
  notifications: mpsc::UnboundedReceiver<Notification>,
}

impl DemoContext {
  pub fn new(config: &Config) -> Result<Self> {
    let storage = open_storage(config)?;
    let store = CacheStore::new();
    for prefix in config.persist_keys()? {
      store.mark_persistable(prefix);
    }
    let layer = CacheLayer::new(store.clone(), storage, config.cache.app_key.clone())
      .with_stale_time(config.stale_time()?);
    layer.hydrate()?;

    let (sink, notifications) = ChannelSink::new();
    let executor = MutationExecutor::new(store, Arc::new((LogSink, sink)))
      .with_poll_config(config.poll_config())
      .with_classifier(config.classifier());

    Ok(Self {
      layer,
      executor,
      notifications,
    })
  }

  pub fn store(&self) -> &CacheStore {
    self.layer.store()
  }

  /// Print every notification received so far.
  pub fn report(&mut self) {
    while let Ok(n) = self.notifications.try_recv() {
      let marker = match n.kind {
        NotificationKind::Success => "ok",
        NotificationKind::Error => "error",
        NotificationKind::Cancelled => "cancelled",
      };
      println!("  [{}] {}", marker, n.message);
    }
  }

  /// Persist the cache and drain remaining notifications.
  pub fn finish(mut self) -> Result<()> {
    self.report();
    let written = self.layer.persist()?;
    println!("persisted {} cache entries", written);
    Ok(())
  }
}

pub fn open_storage(config: &Config) -> Result<DynStorage> {
  if config.cache.persist {
    Ok(Box::new(SqliteStorage::open(&config.db_path()?)?))
  } else {
    Ok(Box::new(NoopStorage))
  }
}

fn describe<R>(outcome: &MutationOutcome<R>) -> String {
  let mut line = format!("{}", outcome.state);
  if let Some(e) = outcome.error() {
    line.push_str(&format!(" ({:?})", e.kind()));
  }
  if outcome.rolled_back {
    line.push_str(", rolled back");
  }
  line
}

fn print_list(label: &str, todos: &[todos::Todo]) {
  let titles: Vec<String> = todos
    .iter()
    .map(|t| format!("{}{}", if t.completed { "[x] " } else { "" }, t.title))
    .collect();
  println!("  {:<10} {}", label, titles.join(", "));
}

/// Create, complete and delete todos, optionally with the backend offline.
pub async fn run_todos(ctx: &mut DemoContext, fail: bool) -> Result<()> {
  let backend = TodoBackend::new(Duration::from_millis(50));
  backend.seed(["Write the changelog", "Review open PRs"]);
  let api = TodoApi::new(backend.clone(), ctx.layer.clone(), ctx.executor.clone());
  let mut views: Vec<_> = TodoFilter::ALL.iter().map(|f| (*f, api.watch(*f))).collect();

  for filter in TodoFilter::ALL {
    api.list(filter).await?;
  }
  if fail {
    println!("backend offline: writes will roll back");
    backend.set_offline(true);
  }

  println!("create \"Buy milk\"");
  let created = api.create("Buy milk").await;
  println!("  -> {}", describe(&created));
  ctx.report();

  let first = backend.snapshot().last().map(|t| t.id.clone()).unwrap_or_default();
  println!("complete todo {}", first);
  let updated = api
    .update(
      &first,
      TodoPatch {
        completed: Some(true),
        ..TodoPatch::default()
      },
    )
    .await;
  println!("  -> {}", describe(&updated));
  ctx.report();

  println!("delete todo {}", first);
  let deleted = api.delete(&first).await;
  println!("  -> {}", describe(&deleted));
  ctx.report();

  // Let invalidation refetches land
  tokio::time::sleep(Duration::from_millis(200)).await;
  println!("cached views:");
  for (filter, query) in views.iter_mut() {
    query.poll();
    match query.data() {
      Some(list) => print_list(filter.as_str(), list),
      None => println!("  {:<10} ({:?})", filter.as_str(), query.state().error()),
    }
  }
  Ok(())
}

fn chain() -> (Arc<Ledger>, SharedContract) {
  let ledger = Ledger::new(Duration::from_millis(250), 2);
  let contract: SharedContract = Arc::new(Mutex::new(GameContract::default()));
  (ledger, contract)
}

/// Register for the whitelist against a local chain.
pub async fn run_whitelist(ctx: &mut DemoContext, already_registered: bool, never_finalize: bool) -> Result<()> {
  let (ledger, contract) = chain();
  if already_registered {
    contract
      .lock()
      .map_err(|_| color_eyre::eyre::eyre!("contract state poisoned"))?
      .register(PLAYER)
      .map_err(|e| color_eyre::eyre::eyre!(e))?;
  }
  if never_finalize {
    println!(
      "chain halted: waiting up to {:?} for confirmation",
      ctx.executor.poll_config().timeout
    );
    ledger.set_halted(true);
  }
  let producer = ledger.start();
  let client = GameClient::new(PLAYER, ledger.clone(), contract.clone(), ctx.executor.clone());
  client.register_fetchers(GAME_ID);
  game::prime(ctx.store(), &contract, PLAYER, GAME_ID);

  println!("register {} for the whitelist", PLAYER);
  let outcome = client.register_whitelist().await;
  println!("  -> {} at height {}", describe(&outcome), ledger.height());
  ctx.report();
  producer.abort();
  Ok(())
}

/// Register, join, vote and claim the prize of one game.
pub async fn run_game(ctx: &mut DemoContext) -> Result<()> {
  let (ledger, contract) = chain();
  contract
    .lock()
    .map_err(|_| color_eyre::eyre::eyre!("contract state poisoned"))?
    .open_game(GAME_ID);
  let producer = ledger.start();
  let client = GameClient::new(PLAYER, ledger.clone(), contract.clone(), ctx.executor.clone());
  client.register_fetchers(GAME_ID);
  game::prime(ctx.store(), &contract, PLAYER, GAME_ID);

  println!("register whitelist");
  println!("  -> {}", describe(&client.register_whitelist().await));
  ctx.report();

  println!("join game {}", GAME_ID);
  println!("  -> {}", describe(&client.join_game(GAME_ID).await));
  ctx.report();

  println!("vote \"blue\"");
  println!("  -> {}", describe(&client.vote(GAME_ID, "blue").await));
  ctx.report();

  contract
    .lock()
    .map_err(|_| color_eyre::eyre::eyre!("contract state poisoned"))?
    .set_winner(GAME_ID, PLAYER);
  println!("claim prize");
  println!("  -> {}", describe(&client.claim_prize(GAME_ID).await));
  ctx.report();

  let balance = contract
    .lock()
    .map_err(|_| color_eyre::eyre::eyre!("contract state poisoned"))?
    .balance(PLAYER);
  println!("balance of {}: {} at height {}", client.address(), balance, ledger.height());
  producer.abort();
  Ok(())
}
