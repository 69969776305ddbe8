use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use splitsync::cache::{LocalCache, SqliteStorage};
use splitsync::config::Config;
use splitsync::mutations::{OfflineMutator, Outcome};
use splitsync::network::{self, NetworkMonitor};
use splitsync::projection::AppState;
use splitsync::queue::EntityKind;
use splitsync::remote::{RemoteClient, RestClient};
use splitsync::sync::{RetryPolicy, SyncEngine};

#[derive(Parser, Debug)]
#[command(name = "splitsync")]
#[command(about = "Offline-first cache and sync queue for a shared-expense backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/splitsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show sync status and cached record counts
  Status,
  /// Pull the remote state, then push queued operations
  Sync {
    /// Only refresh the cache from the remote
    #[arg(long, conflicts_with = "push_only")]
    pull_only: bool,
    /// Only drain the operation queue
    #[arg(long)]
    push_only: bool,
  },
  /// Inspect or edit the operation queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
  /// Create a record from a JSON object
  Create { entity: EntityKind, json: String },
  /// Apply a JSON object of changes to a record
  Update {
    entity: EntityKind,
    id: String,
    json: String,
  },
  /// Delete a record
  Delete { entity: EntityKind, id: String },
  /// Send a chat message
  Message {
    conversation_id: String,
    sender_id: String,
    text: String,
  },
  /// Keep probing connectivity and sync on every reconnect until Ctrl-C
  Watch,
  /// Remove all local state: cached collections, metadata and the queue
  SignOut,
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  /// List every queued operation
  List,
  /// Remove one operation by id
  Remove { id: String },
  /// Remove every operation
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.verbose)?;

  let config = Config::load(args.config.as_deref())?;
  let storage = match &config.cache.path {
    Some(path) => SqliteStorage::open(path)?,
    None => SqliteStorage::open_default()?,
  };
  let cache = LocalCache::new(storage);
  let remote: Arc<dyn RemoteClient> = Arc::new(RestClient::new(&config)?);
  let engine = Arc::new(SyncEngine::new(
    cache,
    remote.clone(),
    RetryPolicy::from_config(&config.sync),
  )?);

  match args.command {
    Command::Status => print_status(&engine),
    Command::Sync {
      pull_only,
      push_only,
    } => {
      if !push_only {
        engine.sync_from_server().await?;
        println!("Cache refreshed from remote");
      }
      if !pull_only {
        let result = engine.process_queue().await;
        println!(
          "Queue drained: {} synced, {} failed",
          result.success_count, result.failed_count
        );
      }
      Ok(())
    }
    Command::Queue { action } => run_queue(&engine, action),
    Command::Create { entity, json } => {
      let mutator = connect(engine, remote).await;
      let (local_id, outcome) = mutator.create(entity, parse_json(&json)?).await?;
      report(&format!("{} {}", entity, local_id), outcome)
    }
    Command::Update { entity, id, json } => {
      let mutator = connect(engine, remote).await;
      let outcome = mutator.update(entity, &id, parse_json(&json)?).await?;
      report(&format!("{} {}", entity, id), outcome)
    }
    Command::Delete { entity, id } => {
      let mutator = connect(engine, remote).await;
      let outcome = mutator.delete(entity, &id).await?;
      report(&format!("{} {}", entity, id), outcome)
    }
    Command::Message {
      conversation_id,
      sender_id,
      text,
    } => {
      let mutator = connect(engine, remote).await;
      let (local_id, outcome) = mutator
        .send_message(&conversation_id, &sender_id, &text)
        .await?;
      report(&format!("message {}", local_id), outcome)
    }
    Command::Watch => watch(engine, remote, &config).await,
    Command::SignOut => {
      engine.sign_out()?;
      println!("Local state cleared");
      Ok(())
    }
  }
}

fn init_logging(verbose: bool) -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("splitsync")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(rolling::daily(&log_dir, "splitsync.log"));
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("splitsync=info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(verbose.then(|| fmt::layer().with_writer(std::io::stderr)))
    .init();

  Ok(guard)
}

/// Build a mutator whose online flag reflects one health check.
async fn connect(engine: Arc<SyncEngine>, remote: Arc<dyn RemoteClient>) -> OfflineMutator {
  let online = match remote.health_check().await {
    Ok(()) => true,
    Err(e) => {
      warn!(error = %e, "remote unreachable, working offline");
      false
    }
  };
  OfflineMutator::new(engine, Arc::new(NetworkMonitor::new(online)))
}

fn parse_json(raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON {}: {}", raw, e))
}

fn report(target: &str, outcome: Outcome) -> Result<()> {
  match outcome {
    Outcome::Confirmed(Some(record)) => {
      let rendered = serde_json::to_string_pretty(&record)
        .map_err(|e| eyre!("Failed to render record: {}", e))?;
      println!("{} confirmed:\n{}", target, rendered);
    }
    Outcome::Confirmed(None) => println!("{} confirmed", target),
    Outcome::Queued(op_id) => println!("{} queued as {}", target, op_id),
    Outcome::Coalesced => println!("{} applied to its queued create", target),
  }
  Ok(())
}

fn print_status(engine: &SyncEngine) -> Result<()> {
  let state = AppState::hydrate(engine);
  let status = serde_json::to_string_pretty(&state.sync)
    .map_err(|e| eyre!("Failed to render status: {}", e))?;
  println!("{}", status);
  println!();
  for (collection, count) in state.counts() {
    println!("{:<20} {}", collection.key(), count);
  }
  Ok(())
}

fn run_queue(engine: &SyncEngine, action: QueueAction) -> Result<()> {
  match action {
    QueueAction::List => {
      if !engine.queue().is_readable() {
        println!("Queue is unreadable and left untouched; `queue clear` resets it");
        return Ok(());
      }
      let operations = engine.queue().list_all();
      let unreadable = engine.queue().unreadable();
      if operations.is_empty() && unreadable.is_empty() {
        println!("Queue is empty");
      }
      for entry in &unreadable {
        println!("unreadable entry kept: {}", entry);
      }
      for op in operations {
        let error = op.last_error.as_deref().unwrap_or("");
        println!(
          "{}  {:<6} {:<18} {:<9} attempts={}  {}",
          op.id,
          op.kind.as_str(),
          op.entity.tag(),
          op.status.to_string(),
          op.attempt_count,
          error
        );
      }
    }
    QueueAction::Remove { id } => {
      if engine.dequeue(&id)? {
        println!("Removed {}", id);
      } else {
        println!("No queued operation {}", id);
      }
    }
    QueueAction::Clear => {
      engine.clear_queue()?;
      println!("Queue cleared");
    }
  }
  Ok(())
}

async fn watch(engine: Arc<SyncEngine>, remote: Arc<dyn RemoteClient>, config: &Config) -> Result<()> {
  let monitor = Arc::new(NetworkMonitor::new(remote.health_check().await.is_ok()));
  monitor.on_disconnect(|| warn!("offline, changes will be queued"));

  let state = Arc::new(Mutex::new(AppState::hydrate(&engine)));
  let _following = AppState::follow(state.clone(), &engine);
  let _changes = {
    let state = state.clone();
    engine.on_collection_change(move |collection| {
      if let Ok(state) = state.lock() {
        info!(%collection, records = state.records(collection).len(), "collection updated");
      }
    })
  };
  let _status = engine.subscribe(|status| {
    info!(
      syncing = status.is_syncing,
      pending = status.pending_count,
      errors = status.errors.len(),
      "sync status"
    );
  });

  let reconnect = network::spawn_reconnect_sync(&monitor, engine.clone(), config.sync.settle_delay());
  let probe = network::spawn_probe(monitor.clone(), remote, config.sync.probe_interval());

  if monitor.is_online() {
    if let Err(e) = engine.full_sync().await {
      warn!(error = %e, "initial sync failed");
    }
  }
  println!(
    "Watching {} (online: {}). Press Ctrl-C to stop.",
    config.remote.url,
    monitor.is_online()
  );

  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

  probe.abort();
  reconnect.abort();
  Ok(())
}
