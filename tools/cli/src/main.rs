//! ShelfSync CLI - Command line interface for the local-first record store.
//!
//! Every command works against the local store first. Only `sync` talks to
//! the remote store; all other commands succeed offline.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

use shelfsync_common::RecordId;
use shelfsync_remote::HttpRemote;
use shelfsync_store::{JsonFileBackend, LocalStore, PendingOperation, Record, SqliteBackend};
use shelfsync_sync::{DeleteOutcome, ManualConnectivity, SyncReport, SyncService};

use crate::config::{
    default_data_dir, parse_fields, parse_value, BackendKind, CliConfig, CONFIG_FILE,
};

#[derive(Parser)]
#[command(name = "shelfsync")]
#[command(about = "ShelfSync - Local-first record sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the local store and shelfsync.json.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Local store backend (overrides the config file).
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendKind>,

    /// Remote API root, e.g. http://192.168.1.91:3000/api (overrides the config file).
    #[arg(long, global = true)]
    remote: Option<Url>,

    /// Treat the remote store as unreachable.
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all records.
    List,

    /// Show one record.
    Show {
        /// Record id (`tmp:<uuid>` for unconfirmed records).
        id: String,
    },

    /// Create a record.
    Create {
        /// Field assignment, name=value (repeatable).
        #[arg(short, long = "field", required = true)]
        fields: Vec<String>,
    },

    /// Update fields of a record.
    Update {
        id: String,

        /// Field assignment, name=value (repeatable).
        #[arg(short, long = "field", required = true)]
        fields: Vec<String>,
    },

    /// Set a single field.
    Set {
        id: String,
        field: String,
        /// JSON value, or plain text.
        value: String,
    },

    /// Delete a record.
    Delete { id: String },

    /// List pending operations.
    Pending,

    /// Reconcile with the remote store.
    Sync,

    /// Re-queue a record whose change was rejected.
    Retry { id: String },

    /// Abandon unconfirmed local changes to a record.
    Discard { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let service = open_service(&cli)?;

    match cli.command {
        Commands::List => cmd_list(&service),
        Commands::Show { id } => cmd_show(&service, &id),
        Commands::Create { fields } => cmd_create(&service, &fields),
        Commands::Update { id, fields } => cmd_update(&service, &id, &fields),
        Commands::Set { id, field, value } => cmd_set(&service, &id, &field, &value),
        Commands::Delete { id } => cmd_delete(&service, &id),
        Commands::Pending => cmd_pending(&service),
        Commands::Sync => cmd_sync(&service).await,
        Commands::Retry { id } => cmd_retry(&service, &id),
        Commands::Discard { id } => cmd_discard(&service, &id),
    }
}

/// Build the service from the config file and command-line overrides.
fn open_service(cli: &Cli) -> Result<SyncService> {
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    let mut config = CliConfig::load(&data_dir)?;
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(url) = &cli.remote {
        config.remote.base_url = Some(url.clone());
    }

    let store_path = data_dir.join(config.backend.file_name());
    let store = match config.backend {
        BackendKind::Sqlite => LocalStore::open(SqliteBackend::open(&store_path)?),
        BackendKind::Json => LocalStore::open(JsonFileBackend::open(&store_path)?),
    }
    .with_context(|| format!("Failed to open store {}", store_path.display()))?;
    info!("Using {} store at {}", store.backend_name(), store_path.display());

    let remote = HttpRemote::new(config.remote).context("Invalid remote configuration")?;
    if !remote.is_configured() {
        warn!("No remote configured; set remote.base_url in {} or pass --remote", CONFIG_FILE);
    }
    let connectivity = ManualConnectivity::new(!cli.offline && remote.is_configured());

    Ok(SyncService::new(
        Arc::new(store),
        Arc::new(remote),
        Arc::new(connectivity),
        config.sync,
    ))
}

fn parse_id(raw: &str) -> Result<RecordId> {
    RecordId::parse(raw).with_context(|| format!("Invalid record id '{}'", raw))
}

fn print_record(record: &Record) -> Result<()> {
    println!(
        "  {:<42} {:<15} {}",
        record.id.to_string(),
        record.sync_state.label(),
        serde_json::to_string(&record.fields)?
    );
    Ok(())
}

fn print_operation(op: &PendingOperation) {
    print!(
        "  #{:<4} {:<7} {}  attempts: {}",
        op.sequence,
        op.kind.label(),
        op.record_id,
        op.attempts
    );
    match &op.last_error {
        Some(error) => println!("  last error: {}", error),
        None => println!(),
    }
}

fn print_report(report: &SyncReport) {
    println!("Sync {:?} in {:?}", report.status, report.duration);
    println!(
        "  Attempted: {}  Succeeded: {}  Failed: {}",
        report.attempted, report.succeeded, report.failed
    );
    if let Some(merge) = &report.merge {
        println!(
            "  Merged: {} refreshed, {} inserted, {} removed, {} kept pending",
            merge.refreshed, merge.inserted, merge.removed, merge.kept_pending
        );
    }
    for failure in &report.errors {
        let target = failure
            .record_id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "snapshot".to_string());
        println!("  [{:?}] {}: {}", failure.class, target, failure.message);
    }
}

/// List all records.
fn cmd_list(service: &SyncService) -> Result<()> {
    let records = service.list_records().context("Failed to list records")?;
    if records.is_empty() {
        println!("No records.");
        return Ok(());
    }
    println!("{} records:", records.len());
    for record in &records {
        print_record(record)?;
    }
    Ok(())
}

fn cmd_show(service: &SyncService, id: &str) -> Result<()> {
    let record = service
        .get_record(&parse_id(id)?)
        .context("Failed to read record")?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn cmd_create(service: &SyncService, fields: &[String]) -> Result<()> {
    let record = service
        .create_record(parse_fields(fields)?)
        .context("Failed to create record")?;
    println!("Record created: {}", record.id);
    Ok(())
}

fn cmd_update(service: &SyncService, id: &str, fields: &[String]) -> Result<()> {
    let record = service
        .update_record(&parse_id(id)?, parse_fields(fields)?)
        .context("Failed to update record")?;
    println!("Record updated: {} ({})", record.id, record.sync_state.label());
    Ok(())
}

fn cmd_set(service: &SyncService, id: &str, field: &str, value: &str) -> Result<()> {
    let record = service
        .update_field(&parse_id(id)?, field, parse_value(value))
        .context("Failed to update field")?;
    println!("Record updated: {} ({})", record.id, record.sync_state.label());
    Ok(())
}

fn cmd_delete(service: &SyncService, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    match service.delete_record(&id).context("Failed to delete record")? {
        DeleteOutcome::Discarded => println!("Record removed: {}", id),
        DeleteOutcome::Queued => println!("Record marked for deletion: {}", id),
    }
    Ok(())
}

fn cmd_pending(service: &SyncService) -> Result<()> {
    let pending = service
        .pending_operations()
        .context("Failed to read queue")?;
    if pending.is_empty() {
        println!("Nothing pending.");
        return Ok(());
    }
    println!("{} pending operations:", pending.len());
    for op in &pending {
        print_operation(op);
    }
    Ok(())
}

async fn cmd_sync(service: &SyncService) -> Result<()> {
    let report = service
        .reconcile()
        .await
        .and_then(SyncReport::require_online)
        .context("Sync failed")?;
    print_report(&report);
    Ok(())
}

fn cmd_retry(service: &SyncService, id: &str) -> Result<()> {
    match service
        .retry_record(&parse_id(id)?)
        .context("Failed to retry record")?
    {
        Some(op) => println!("Queued {} for {}", op.kind.label(), op.record_id),
        None => println!("Record has no local changes."),
    }
    Ok(())
}

fn cmd_discard(service: &SyncService, id: &str) -> Result<()> {
    match service
        .discard_local_changes(&parse_id(id)?)
        .context("Failed to discard changes")?
    {
        Some(record) => println!("Local changes discarded: {}", record.id),
        None => println!("Unconfirmed record removed."),
    }
    Ok(())
}
