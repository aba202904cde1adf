//! MeshSync CLI
//!
//! Thin wrapper around meshsync-core for inspecting and reconciling sync
//! indexes from the command line.
//!
//! ## Usage
//!
//! ```bash
//! # Show index information
//! meshsync info
//!
//! # Index a JSON array of operations
//! meshsync import ops.json
//!
//! # Populate an empty index from a ledger export
//! meshsync bootstrap ledger.json
//!
//! # Show the reconciliation windows for the index
//! meshsync windows
//!
//! # Reconcile against another index and copy the differences
//! meshsync reconcile peer.redb --apply
//!
//! # Print the configuration read from MESHSYNC_* variables
//! meshsync config
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshsync_core::{
    bootstrap_sync_store_if_empty, map_accepted_operations_to_sync_records, MediatorConfig,
    MemoryLedger, NegentropyAdapter, Operation, OperationSyncStore, RedbSyncStore, SessionOptions,
    SyncRecord,
};
use tracing::{debug, info};

/// MeshSync - windowed set reconciliation for operation ledgers
#[derive(Parser)]
#[command(name = "meshsync")]
#[command(version = "0.1.0")]
#[command(about = "MeshSync - windowed set reconciliation for operation ledgers")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Sync index database (default: ~/.meshsync/sync.redb)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show sync index information
    Info,

    /// Index operations from a JSON array
    Import {
        /// File containing a JSON array of operations
        file: PathBuf,
    },

    /// Populate the index from a ledger export unless it is already in sync
    Bootstrap {
        /// File containing a JSON array of ledger operations
        ledger: PathBuf,
    },

    /// Show the reconciliation windows for the index
    Windows {
        /// Clock in epoch seconds (default: now)
        #[arg(long)]
        now: Option<i64>,
    },

    /// Reconcile the index against another index
    Reconcile {
        /// Peer sync index database
        peer_db: PathBuf,

        /// Round cap per window (default: from configuration)
        #[arg(long)]
        max_rounds: Option<u32>,

        /// Copy missing records in both directions
        #[arg(long)]
        apply: bool,
    },

    /// Print the validated configuration
    Config,
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default database path (~/.meshsync/sync.redb)
fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".meshsync")
        .join("sync.redb")
}

fn open_store(path: &Path) -> Result<Arc<RedbSyncStore>> {
    let store = RedbSyncStore::open(path)
        .with_context(|| format!("Failed to open sync index at {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Read a JSON array of operations
fn read_operations(path: &Path) -> Result<Vec<Operation>> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let operations: Vec<Operation> = serde_json::from_str(&body)
        .map_err(|e| anyhow::anyhow!("Invalid operations file '{}': {}", path.display(), e))?;
    Ok(operations)
}

fn format_ts(ts: i64) -> String {
    match chrono::DateTime::from_timestamp(ts, 0) {
        Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        None => "(out of range)".to_string(),
    }
}

/// Copy `ids` from one store to another; returns rows inserted
fn copy_records(
    from: &dyn OperationSyncStore,
    to: &dyn OperationSyncStore,
    ids: &[String],
) -> Result<usize> {
    let records: Vec<SyncRecord> = from
        .get_by_ids(ids)?
        .into_iter()
        .map(|row| SyncRecord::new(row.id, row.ts, row.operation))
        .collect();
    Ok(to.upsert_many(&records)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = MediatorConfig::from_env()?;
    let db_path = cli.db.unwrap_or_else(default_db_path);
    debug!(db = %db_path.display(), node = %config.node_name, "Resolved sync index");

    match cli.command {
        Commands::Info => {
            let store = open_store(&db_path)?;

            println!("MeshSync v0.1.0");
            println!();
            println!("Sync index:");
            println!("  Path: {}", db_path.display());
            println!("  Records: {}", store.count()?);
            match store.earliest_ts()? {
                Some(ts) => println!("  Earliest: {} ({})", format_ts(ts), ts),
                None => println!("  Earliest: (empty)"),
            }
            println!();
            println!("Node: {}", config.node_name);
            println!(
                "Sync modes: negentropy={} legacy={}",
                config.negentropy_enabled, config.legacy_sync_enabled
            );
        }

        Commands::Import { file } => {
            let operations = read_operations(&file)?;
            let store = open_store(&db_path)?;

            let mapped = map_accepted_operations_to_sync_records(&operations);
            let inserted = store.upsert_many(&mapped.records)?;

            println!("Imported operations:");
            println!("  Received: {}", operations.len());
            println!("  Invalid: {}", mapped.invalid);
            println!("  Inserted: {}", inserted);
            println!("  Already indexed: {}", mapped.records.len() - inserted);
            println!("  Total records: {}", store.count()?);
        }

        Commands::Bootstrap { ledger } => {
            let operations = read_operations(&ledger)?;
            let ledger = MemoryLedger::with_operations(operations);
            let store = open_store(&db_path)?;

            let result =
                bootstrap_sync_store_if_empty(&*store, &ledger, &config.bootstrap_options())
                    .await?;

            if result.skipped {
                let reason = result
                    .reason
                    .map(|r| format!("{r:?}"))
                    .unwrap_or_default();
                println!("Bootstrap skipped: {}", reason);
            } else {
                println!("Bootstrap complete");
            }
            println!("  Before: {}", result.count_before);
            println!("  After: {}", result.count_after);
            println!("  Exported: {}", result.exported);
            println!("  Mapped: {}", result.mapped);
            println!("  Invalid: {}", result.invalid);
            println!("  Inserted: {}", result.inserted);
            println!(
                "  Drift: {:.2}% (threshold {:.2}%)",
                result.drift_pct * 100.0,
                result.drift_threshold_pct * 100.0
            );
        }

        Commands::Windows { now } => {
            let store = open_store(&db_path)?;
            let adapter =
                NegentropyAdapter::create(store.clone(), config.adapter_options().deferred())?;
            let now = now.unwrap_or_else(|| chrono::Utc::now().timestamp());
            let windows = adapter.plan_windows(now)?;

            if windows.is_empty() {
                println!("No windows (index is empty)");
            } else {
                println!("Windows ({}):", windows.len());
                for window in &windows {
                    println!(
                        "  {:>3} {:<12} {} .. {}  [{} .. {}] max {}",
                        window.order,
                        window.name,
                        format_ts(window.from_ts),
                        format_ts(window.to_ts),
                        window.from_ts,
                        window.to_ts,
                        window.max_records
                    );
                }
            }
        }

        Commands::Reconcile {
            peer_db,
            max_rounds,
            apply,
        } => {
            if peer_db == db_path {
                anyhow::bail!("Peer index must differ from --db ({})", db_path.display());
            }
            let local = open_store(&db_path)?;
            let remote = open_store(&peer_db)?;

            let options = config.adapter_options().deferred();
            let mut adapter = NegentropyAdapter::create(local.clone(), options.clone())?;
            let mut peer = NegentropyAdapter::create(remote.clone(), options)?;
            let stats = adapter.run_windowed_session_with_peer(
                &mut peer,
                SessionOptions {
                    now_ts: None,
                    max_rounds_per_session: max_rounds,
                },
            )?;

            println!("Reconciled {} window(s):", stats.window_count);
            for window in &stats.windows {
                let status = if window.completed {
                    "complete"
                } else if window.capped_by_rounds {
                    "round cap"
                } else {
                    "incomplete"
                };
                let records_note = if window.capped_by_records {
                    " (record cap)"
                } else {
                    ""
                };
                println!(
                    "  {:<12} loaded {}{} rounds {} {}",
                    window.window_name, window.loaded, records_note, window.rounds, status
                );
            }
            println!();
            println!("Have (local only): {}", stats.have_ids.len());
            println!("Need (peer only): {}", stats.need_ids.len());
            println!("Rounds: {}", stats.rounds);

            if apply {
                let pushed = copy_records(&*local, &*remote, &stats.have_ids)?;
                let pulled = copy_records(&*remote, &*local, &stats.need_ids)?;
                info!(pushed, pulled, peer = %peer_db.display(), "Applied reconciliation");
                println!();
                println!("Applied:");
                println!("  Copied to peer: {}", pushed);
                println!("  Copied from peer: {}", pulled);
            }
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
