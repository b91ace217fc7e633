use chrono::Duration;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use sunat_sync::cache::{
  CacheEngine, DurableStore, InvalidateOptions, MemoryStorage, NoopStorage, SqliteStorage,
};
use sunat_sync::config::Config;
use sunat_sync::logging;
use sunat_sync::reconcile::ReconciliationService;
use sunat_sync::records::Scope;
use sunat_sync::store::{RecordStore, SqliteRecordStore};
use sunat_sync::sunat::{scope_invalidation, FileFetcher, RecordKind, SyncClient};

#[derive(Parser, Debug)]
#[command(name = "sunat-sync")]
#[command(about = "Cache-first sync of SUNAT electronic ledgers into a local record store")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/sunat-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Directory holding ledger exports, overrides the config file
  #[arg(short, long)]
  exports: Option<PathBuf>,

  /// Keep cache and records in memory for this run only
  #[arg(long)]
  ephemeral: bool,

  /// Cache in process memory only, never in the database
  #[arg(long, conflicts_with = "ephemeral")]
  no_durable_cache: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch (or reuse cached) ledger rows and reconcile them
  Sync {
    #[arg(value_enum)]
    kind: RecordKind,
    /// Taxpayer RUC
    owner: String,
    /// Periods as YYYYMM
    #[arg(required = true)]
    periods: Vec<String>,
    /// Skip the cache and fetch again
    #[arg(long)]
    refresh: bool,
  },
  /// Print reconciled records for a scope
  Records { owner: String, period: String },
  /// Print cache statistics
  Stats,
  /// Remove cache entries matching a glob pattern, or everything
  Clear { pattern: Option<String> },
  /// Invalidate cached ledgers by scope or by age
  Invalidate {
    #[arg(value_enum, required_unless_present = "older_than_minutes")]
    kind: Option<RecordKind>,
    owner: Option<String>,
    period: Option<String>,
    /// Drop every entry created more than this many minutes ago
    #[arg(long, conflicts_with = "kind")]
    older_than_minutes: Option<i64>,
  },
  /// Purge expired cache entries
  Sweep,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(exports) = args.exports {
    config.sunat.export_dir = exports;
  }

  let _log_guard = logging::init(&config.log)?;

  if args.ephemeral {
    let storage = MemoryStorage::new();
    let store = SqliteRecordStore::open_in_memory()?;
    run(args.command, &config, storage, store).await
  } else {
    let path = config.database_path()?;
    tracing::debug!(path = %path.display(), "opening database");
    let store = SqliteRecordStore::open(&path)?;
    if args.no_durable_cache {
      run(args.command, &config, NoopStorage, store).await
    } else {
      run(args.command, &config, SqliteStorage::open(&path)?, store).await
    }
  }
}

async fn run<S: DurableStore + 'static>(
  command: Command,
  config: &Config,
  storage: S,
  store: SqliteRecordStore,
) -> Result<()> {
  let cache = Arc::new(CacheEngine::new(storage, config.cache.clone()));
  let sweeper = cache.clone().spawn_sweeper();
  let store = Arc::new(store);

  let outcome = match command {
    Command::Sync {
      kind,
      owner,
      periods,
      refresh,
    } => {
      let client = SyncClient::new(
        FileFetcher::new(&config.sunat.export_dir),
        cache.clone(),
        ReconciliationService::new(store.clone()),
      );
      let mut reports = Vec::with_capacity(periods.len());
      for period in &periods {
        reports.push(client.sync(kind, &owner, period, refresh).await?);
      }
      print_json(&reports)
    }
    Command::Records { owner, period } => {
      let scope = Scope::new(&owner, &period)?;
      print_json(&store.list(&scope)?)
    }
    Command::Stats => print_json(&cache.stats()),
    Command::Clear { pattern } => {
      println!("removed {}", cache.clear(pattern.as_deref()));
      Ok(())
    }
    Command::Invalidate {
      kind,
      owner,
      period,
      older_than_minutes,
    } => {
      let options = match (older_than_minutes, kind) {
        (Some(minutes), _) => {
          let max_age = Duration::try_minutes(minutes)
            .ok_or_else(|| eyre!("--older-than-minutes {} is out of range", minutes))?;
          InvalidateOptions::older_than(max_age)
        }
        (None, Some(kind)) => scope_invalidation(kind, owner.as_deref(), period.as_deref()),
        (None, None) => InvalidateOptions::default(),
      };
      println!("removed {}", cache.invalidate(&options));
      Ok(())
    }
    Command::Sweep => {
      println!("removed {}", cache.sweep());
      Ok(())
    }
  };

  sweeper.abort();
  outcome
}
