//! CLI subcommands.

use async_trait::async_trait;
use chrono::Utc;
use clap::{Args, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use url::Url;

use offline_sync::cache::{DataType, Ttl};
use offline_sync::engine::SyncEngine;
use offline_sync::error::TransportError;
use offline_sync::events::SyncEvent;
use offline_sync::queue::{ActionType, PendingAction};
use offline_sync::store::SqliteStore;
use offline_sync::sync::{probe, DrainOutcome, HttpTransport, Transport};

use crate::config::Config;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Show queue, dead-letter and cache summary
  Status,
  /// Inspect and edit the pending action queue
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Inspect and edit the read cache
  #[command(subcommand)]
  Cache(CacheCommand),
  /// Run one drain pass against the backend
  Sync {
    /// Number of recorded events to print afterwards
    #[arg(long, default_value_t = 20)]
    events: usize,
  },
  /// Keep draining whenever the backend is reachable, until Ctrl-C
  Run,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
  /// List queued actions in delivery order
  List,
  /// Queue an action with a JSON payload
  Add {
    /// Action type, e.g. order_status_update
    action_type: ActionType,
    /// JSON payload
    payload: String,
    #[arg(long)]
    max_retries: Option<u32>,
  },
  /// List permanently failed actions
  Failed,
  /// Discard a permanently failed action
  Ack { id: i64 },
  /// Move a permanently failed action back into the queue
  Retry { id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
  /// List cached entries
  List,
  /// Print a cached entry
  Get { key: String },
  /// Cache a JSON value
  Put(PutArgs),
  /// Remove one entry
  Invalidate { key: String },
  /// Remove every entry
  Clear,
  /// Remove expired entries
  Sweep,
}

#[derive(Args, Debug)]
pub struct PutArgs {
  key: String,
  /// JSON value
  value: String,
  /// Data type, which picks the default TTL
  #[arg(long = "type", default_value = "other")]
  data_type: DataType,
  /// Explicit TTL in seconds
  #[arg(long, conflicts_with = "no_expiry")]
  ttl: Option<i64>,
  /// Keep the entry until invalidated
  #[arg(long)]
  no_expiry: bool,
}

/// Stand-in transport when no backend is configured.
struct Unconfigured;

#[async_trait]
impl Transport for Unconfigured {
  async fn deliver(&self, _action: &PendingAction) -> Result<(), TransportError> {
    Err(TransportError::Offline)
  }
}

pub async fn run(command: Command, config: &Config) -> Result<()> {
  match command {
    Command::Status => status(config).await,
    Command::Queue(cmd) => queue(cmd, config).await,
    Command::Cache(cmd) => cache(cmd, config).await,
    Command::Sync { events } => sync_once(config, events).await,
    Command::Run => run_forever(config).await,
  }
}

fn open_store(config: &Config) -> Result<SqliteStore> {
  let store = match &config.store.path {
    Some(path) => SqliteStore::open(path),
    None => SqliteStore::open_default(),
  };
  store.map_err(|e| eyre!("Failed to open sync store: {}", e))
}

/// Engine for local inspection. Nothing is delivered.
fn offline_engine(config: &Config) -> Result<SyncEngine> {
  let engine = SyncEngine::new(
    open_store(config)?,
    Arc::new(Unconfigured),
    config.engine_options()?,
  );
  engine.coordinator().set_online(false);
  Ok(engine)
}

fn http_transport(config: &Config) -> Result<HttpTransport> {
  HttpTransport::new(
    config.transport_url()?,
    Config::get_api_token(),
    config.delivery_timeout(),
  )
  .map_err(|e| eyre!("Failed to set up transport: {}", e))
}

fn parse_json(raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Payload is not valid JSON: {}", e))
}

fn ttl_from_secs(secs: i64) -> Result<chrono::Duration> {
  chrono::Duration::try_seconds(secs).ok_or_else(|| eyre!("--ttl {} is out of range", secs))
}

fn print_action(action: &PendingAction) {
  let age = action.age(Utc::now());
  println!(
    "#{:<6} {:<20} tries {}/{}  queued {}s ago{}",
    action.id,
    action.action_type,
    action.retry_count,
    action.max_retries,
    age.num_seconds(),
    action
      .last_error
      .as_deref()
      .map(|e| format!("  last error: {}", e))
      .unwrap_or_default()
  );
}

fn print_event(event: &SyncEvent) {
  println!(
    "{} {:<15} {}{}",
    event.timestamp.format("%H:%M:%S%.3f"),
    event.kind,
    event.details.as_deref().unwrap_or(""),
    event
      .error_message
      .as_deref()
      .map(|e| format!(" ({})", e))
      .unwrap_or_default()
  );
}

async fn status(config: &Config) -> Result<()> {
  let engine = offline_engine(config)?;
  let pending = engine.queue().pending_count().await?;
  let failed = engine.queue().failed_count().await?;
  let cache = engine.cache().status().await?;

  println!("backend:         {}", config.transport.url.as_deref().unwrap_or("(not configured)"));
  println!("pending actions: {}", pending);
  println!("failed actions:  {}", failed);
  println!(
    "cache entries:   {} ({} expired, {} bytes)",
    cache.total, cache.expired, cache.total_bytes
  );
  for (data_type, count) in &cache.by_type {
    println!("  {:<14} {}", data_type, count);
  }
  Ok(())
}

async fn queue(cmd: QueueCommand, config: &Config) -> Result<()> {
  let engine = offline_engine(config)?;
  let queue = engine.queue();

  match cmd {
    QueueCommand::List => {
      let actions = queue.list_all().await?;
      if actions.is_empty() {
        println!("queue is empty");
      }
      actions.iter().for_each(print_action);
    }
    QueueCommand::Add {
      action_type,
      payload,
      max_retries,
    } => {
      let payload = serde_json::to_vec(&parse_json(&payload)?)?;
      let max_retries = max_retries.unwrap_or(queue.default_max_retries());
      let action = queue
        .enqueue_with_retries(action_type, payload, max_retries)
        .await?;
      println!("queued action #{}", action.id);
    }
    QueueCommand::Failed => {
      let failed = queue.list_failed().await?;
      if failed.is_empty() {
        println!("no failed actions");
      }
      for entry in &failed {
        print_action(&entry.action);
        println!("        failed at {}", entry.failed_at.to_rfc3339());
      }
    }
    QueueCommand::Ack { id } => {
      if !queue.acknowledge(id).await? {
        return Err(eyre!("No failed action #{}", id));
      }
      println!("discarded action #{}", id);
    }
    QueueCommand::Retry { id } => match queue.requeue(id).await? {
      Some(action) => println!("requeued #{} as #{}", id, action.id),
      None => return Err(eyre!("No failed action #{}", id)),
    },
  }
  Ok(())
}

async fn cache(cmd: CacheCommand, config: &Config) -> Result<()> {
  let engine = offline_engine(config)?;
  let cache = engine.cache();

  match cmd {
    CacheCommand::List => {
      let now = Utc::now();
      for entry in cache.entries().await? {
        let expiry = match entry.expires_at {
          Some(at) if entry.is_expired(now) => format!("expired {}", at.to_rfc3339()),
          Some(at) => format!("expires {}", at.to_rfc3339()),
          None => "never expires".to_string(),
        };
        println!(
          "{:<30} {:<13} {:>8}B  {}  {}",
          entry.key,
          entry.data_type,
          entry.size,
          entry.sync_status.as_str(),
          expiry
        );
      }
    }
    CacheCommand::Get { key } => match cache.get::<Value>(&key).await? {
      Some(cached) => {
        println!("cached at {}", cached.cached_at.to_rfc3339());
        println!("{}", serde_json::to_string_pretty(&cached.data)?);
      }
      None => return Err(eyre!("No fresh cache entry for '{}'", key)),
    },
    CacheCommand::Put(args) => {
      let value = parse_json(&args.value)?;
      let ttl = match (args.no_expiry, args.ttl) {
        (true, _) => Ttl::Never,
        (false, Some(secs)) => Ttl::After(ttl_from_secs(secs)?),
        (false, None) => Ttl::Default,
      };
      let meta = cache.put(&args.key, &value, args.data_type, ttl).await?;
      println!("cached '{}' ({} bytes)", meta.key, meta.size);
    }
    CacheCommand::Invalidate { key } => {
      if cache.invalidate(&key).await? {
        println!("removed '{}'", key);
      } else {
        println!("'{}' was not cached", key);
      }
    }
    CacheCommand::Clear => println!("removed {} entries", cache.clear().await?),
    CacheCommand::Sweep => println!("removed {} expired entries", cache.sweep_expired().await?),
  }
  Ok(())
}

async fn sync_once(config: &Config, event_count: usize) -> Result<()> {
  let transport = http_transport(config)?;
  let engine = SyncEngine::new(open_store(config)?, Arc::new(transport), config.engine_options()?);

  let outcome = engine.trigger_sync().await?;
  match outcome {
    DrainOutcome::Finished(summary) => println!("{}", summary),
    DrainOutcome::Empty => println!("nothing to deliver"),
    DrainOutcome::Offline => println!("offline, nothing delivered"),
    DrainOutcome::Coalesced => println!("a drain is already running"),
  }
  engine.events().recent(event_count).iter().for_each(print_event);
  Ok(())
}

async fn run_forever(config: &Config) -> Result<()> {
  let transport = http_transport(config)?;
  let probe_url: Url = transport.base_url().clone();
  let signals = probe(transport.client().clone(), probe_url, config.probe_interval());

  let engine = SyncEngine::new(open_store(config)?, Arc::new(transport), config.engine_options()?);
  let mut events = engine.events().subscribe();
  let observer = engine.spawn_observer(signals);
  let sweeper = engine.spawn_sweeper(config.sweep_interval());
  info!("sync loop running");

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.recv() => match event {
        Ok(event) => print_event(&event),
        Err(RecvError::Lagged(skipped)) => println!("... {} events skipped", skipped),
        Err(RecvError::Closed) => break,
      },
    }
  }

  observer.abort();
  sweeper.abort();
  info!("sync loop stopped");
  Ok(())
}
