mod commands;
mod config;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "offline-sync")]
#[command(about = "Offline action queue and read cache with background sync")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also write logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: commands::Command,
}

/// Log to a daily file under the data directory. Filter with OFFLINE_SYNC_LOG.
fn init_logging(verbose: bool) -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("offline-sync")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "offline-sync.log"));

  let filter = EnvFilter::try_from_env("OFFLINE_SYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
  let file_layer = tracing_subscriber::fmt::layer()
    .with_writer(writer)
    .with_ansi(false);
  let stderr_layer = verbose.then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

  tracing_subscriber::registry()
    .with(filter)
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.verbose)?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  commands::run(args.command, &config).await
}
