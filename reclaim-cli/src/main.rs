use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use reclaim_core::{FileStore, SyncConfig};
use reclaim_sync::{LocalQueue, Operation, OperationKind, QueueItemId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod table;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    /// Table format (default)
    Table,
    /// Pretty JSON
    Json,
}

#[derive(Parser)]
#[command(name = "reclaim")]
#[command(about = "Reclaim offline queue CLI", long_about = None)]
struct Cli {
    /// Directory holding the durable queue
    #[arg(short, long, default_value = "reclaim-data")]
    data_dir: PathBuf,

    /// Device prefix for generated idempotency keys
    #[arg(long)]
    device: Option<String>,

    /// Attempts before a failing item is retired to the dead set
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Seconds allowed for each remote apply call
    #[arg(long, value_name = "SECS")]
    apply_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue an operation
    Enqueue {
        /// Operation kind (create_transaction, create_material, create_expense, create_order)
        kind: String,
        /// Payload as JSON
        payload: String,
    },
    /// List active queue items
    List {
        /// Output format (table, json)
        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },
    /// Show queue counts
    Stats {
        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },
    /// List items retired into the dead set
    Dead {
        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },
    /// Move a dead item back into the queue
    Requeue {
        /// Item id
        id: u64,
    },
    /// Permanently drop a dead item
    Discard {
        /// Item id
        id: u64,
    },
    /// Drain the queue against an HTTP backend
    #[cfg(feature = "http-sync")]
    Sync {
        /// Base URL of the backend
        #[arg(short, long)]
        endpoint: String,
        /// Bearer token
        #[arg(long, env = "RECLAIM_TOKEN")]
        token: Option<String>,
    },
}

fn main() -> Result<()> {
    // Default to warn so command output stays readable; override with RUST_LOG
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.sync_config();

    match cli.command {
        Commands::Enqueue { kind, payload } => {
            let queue = open_queue(&cli.data_dir, &config)?;

            let kind = OperationKind::parse(&kind)
                .ok_or_else(|| anyhow::anyhow!("Unknown operation kind: {}", kind))?;
            let json: serde_json::Value = serde_json::from_str(&payload).context("Invalid JSON")?;
            let operation = Operation::from_parts(kind, json).context("Payload does not match operation kind")?;

            let item = queue.enqueue(operation).context("Failed to enqueue operation")?;
            println!("✓ Queued item {} with key {}", item.id, item.idempotency_key);
        }

        Commands::List { output } => {
            let queue = open_queue(&cli.data_dir, &config)?;
            let items = queue.items();
            match output {
                OutputFormat::Table => {
                    println!("{}", table::format_items_table(&items));
                    println!();
                    println!("Count: {}", items.len());
                }
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
        }

        Commands::Stats { output } => {
            let queue = open_queue(&cli.data_dir, &config)?;
            let stats = queue.stats();
            match output {
                OutputFormat::Table => println!("{}", table::format_stats_table(&stats)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
            }
        }

        Commands::Dead { output } => {
            let queue = open_queue(&cli.data_dir, &config)?;
            let letters = queue.dead_letters();
            match output {
                OutputFormat::Table => println!("{}", table::format_dead_table(&letters)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&letters)?),
            }
        }

        Commands::Requeue { id } => {
            let queue = open_queue(&cli.data_dir, &config)?;
            let item = queue
                .requeue_dead(QueueItemId(id))
                .with_context(|| format!("Failed to requeue item {}", id))?;
            println!("✓ Item {} is pending again", item.id);
        }

        Commands::Discard { id } => {
            let queue = open_queue(&cli.data_dir, &config)?;
            queue
                .discard_dead(QueueItemId(id))
                .with_context(|| format!("Failed to discard item {}", id))?;
            println!("✓ Item {} discarded", id);
        }

        #[cfg(feature = "http-sync")]
        Commands::Sync { endpoint, token } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_sync(&cli.data_dir, config, endpoint, token))?;
        }
    }

    Ok(())
}

impl Cli {
    /// Map the global flags onto the sync configuration
    fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::new();
        if let Some(device) = &self.device {
            config = config.with_device_prefix(device.clone());
        }
        if let Some(max_attempts) = self.max_attempts {
            config = config.with_max_attempts(max_attempts);
        }
        if let Some(secs) = self.apply_timeout {
            config = config.with_apply_timeout(Duration::from_secs(secs));
        }
        config
    }
}

fn open_queue(data_dir: &Path, config: &SyncConfig) -> Result<LocalQueue> {
    tracing::debug!(dir = %data_dir.display(), "Opening queue");
    let store = FileStore::open(data_dir)
        .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;
    let queue = LocalQueue::open(Arc::new(store), config).context("Failed to open queue")?;
    Ok(queue)
}

#[cfg(feature = "http-sync")]
async fn run_sync(data_dir: &Path, config: SyncConfig, endpoint: String, token: Option<String>) -> Result<()> {
    use reclaim_sync::{HttpRemote, NetworkMonitor, OfflineSync};

    let store = FileStore::open(data_dir)
        .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;

    let mut remote = HttpRemote::new(endpoint.clone());
    if let Some(token) = token {
        remote = remote.with_auth_token(token);
    }

    // An operator asking to sync is asserting connectivity
    let sync = OfflineSync::builder()
        .with_store(Arc::new(store))
        .with_remote_for_all(Arc::new(remote))
        .with_monitor(NetworkMonitor::new(true))
        .with_config(config)
        .build()
        .context("Failed to open sync engine")?;

    println!("Syncing {} items with {}", sync.stats().total, endpoint);
    let outcome = sync.force_sync().await;

    println!(
        "✓ Applied {}, failed {}, retired {}",
        outcome.success, outcome.failed, outcome.retired
    );
    println!("{}", table::format_stats_table(&sync.stats()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_map_onto_config() {
        let cli = Cli::try_parse_from([
            "reclaim",
            "--device",
            "till07",
            "--max-attempts",
            "8",
            "--apply-timeout",
            "12",
            "stats",
        ])
        .unwrap();

        let config = cli.sync_config();
        assert_eq!(config.device_prefix.as_deref(), Some("till07"));
        assert_eq!(config.max_attempts, 8);
        assert_eq!(config.apply_timeout, Duration::from_secs(12));
    }

    #[test]
    fn test_defaults_apply_without_flags() {
        let cli = Cli::try_parse_from(["reclaim", "list"]).unwrap();
        let config = cli.sync_config();
        assert_eq!(config.max_attempts, SyncConfig::new().max_attempts);
        assert_eq!(cli.data_dir, PathBuf::from("reclaim-data"));
    }

    #[test]
    fn test_zero_attempts_is_rejected_on_open() {
        let dir = tempfile::TempDir::new().unwrap();
        let cli = Cli::try_parse_from(["reclaim", "--max-attempts", "0", "stats"]).unwrap();
        assert!(open_queue(dir.path(), &cli.sync_config()).is_err());

        let cli = Cli::try_parse_from(["reclaim", "--max-attempts", "2", "stats"]).unwrap();
        assert!(open_queue(dir.path(), &cli.sync_config()).is_ok());
    }
}
