use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

use qsync::cache::{CacheLayer, CacheStore};
use qsync::config::Config;
use qsync::{demo, logging};

#[derive(Parser, Debug)]
#[command(name = "qsync")]
#[command(about = "Optimistic mutations with cache reconciliation")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/qsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run a demo flow against in-memory backends
  Demo {
    #[command(subcommand)]
    flow: DemoFlow,
  },
  /// Inspect or clear the persisted cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum DemoFlow {
  /// Create, complete and delete todos
  Todos {
    /// Take the backend offline so every write rolls back
    #[arg(long)]
    fail: bool,
  },
  /// Register for the whitelist on a local chain
  Whitelist {
    /// Address is already on the whitelist
    #[arg(long)]
    already_registered: bool,
    /// Halt the chain so the receipt never finalizes
    #[arg(long)]
    never_finalize: bool,
  },
  /// Register, join, vote and claim a prize
  Game,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// List persisted entries
  Show,
  /// Delete persisted entries for the configured app key
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = logging::init(&config.logging)?;

  match args.command {
    Command::Demo { flow } => {
      let mut ctx = demo::DemoContext::new(&config)?;
      match flow {
        DemoFlow::Todos { fail } => demo::run_todos(&mut ctx, fail).await?,
        DemoFlow::Whitelist {
          already_registered,
          never_finalize,
        } => demo::run_whitelist(&mut ctx, already_registered, never_finalize).await?,
        DemoFlow::Game => demo::run_game(&mut ctx).await?,
      }
      ctx.finish()?;
    }
    Command::Cache { action } => {
      let app_key = &config.cache.app_key;
      let layer = CacheLayer::new(CacheStore::new(), demo::open_storage(&config)?, app_key.clone());
      match action {
        CacheAction::Show => {
          let entries = layer.stored()?;
          println!("{} persisted entries for {}", entries.len(), app_key);
          for p in entries {
            println!(
              "  {} [{}] updated {}",
              p.key,
              p.entry.status,
              p.entry.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
          }
        }
        CacheAction::Clear => {
          layer.clear()?;
          println!("cleared persisted cache for {}", app_key);
        }
      }
    }
  }

  Ok(())
}
