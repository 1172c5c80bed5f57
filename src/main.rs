use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use hauler::config::AppConfig;
use hauler::context::AppContext;
use hauler::core::{
    NetworkClass, TransferError, TransferId, TransferListener, TransferObserver, TransferRequest,
    TransferState,
};
use hauler::db::RecordStore;
use hauler::logging::{self, LogConfig};
use serde::Serialize;
use tracing::info;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const WAIT_FOREVER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Parser)]
#[command(name = "hauler")]
#[command(about = "Resumable object transfers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args, Serialize)]
struct GlobalArgs {
    /// Drive connectivity from stdin (`wifi`, `cell`, `off`).
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    storage_root: Option<PathBuf>,
}

#[derive(Args)]
struct TransferArgs {
    bucket: String,
    key: String,
    file: PathBuf,

    #[arg(long, value_enum)]
    network: Option<NetworkClass>,
}

#[derive(Subcommand)]
enum Commands {
    Upload(TransferArgs),
    Download(TransferArgs),
    /// Resume every pending transfer and wait for them.
    Recover,
    /// List transfers, or show one with its status history.
    Status { id: Option<TransferId> },
    /// Delete a transfer record, canceling it first if needed.
    Purge { id: TransferId },
    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::new(Some(&cli.global))?;

    if let Commands::Config = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    logging::init(LogConfig::from(&config))?;
    let ctx = AppContext::new(config).await?;

    let result = match cli.command {
        Commands::Upload(args) => {
            let request = TransferRequest::upload(args.bucket, args.key, args.file);
            run_transfer(&ctx, request, args.network).await
        }
        Commands::Download(args) => {
            let request = TransferRequest::download(args.bucket, args.key, args.file);
            run_transfer(&ctx, request, args.network).await
        }
        Commands::Recover => run_recover(&ctx).await,
        Commands::Status { id } => run_status(&ctx, id).await,
        Commands::Purge { id } => ctx
            .coordinator
            .delete_record(id)
            .await
            .with_context(|| format!("Failed to delete transfer {id}")),
        Commands::Config => Ok(()),
    };

    ctx.shutdown(SHUTDOWN_TIMEOUT).await;
    result
}

/// Prints state changes as they happen.
struct ConsoleListener;

impl TransferListener for ConsoleListener {
    fn on_state_changed(&self, id: TransferId, state: TransferState) {
        println!("[{id}] {state}");
    }

    fn on_error(&self, id: TransferId, error: &TransferError) {
        eprintln!("[{id}] error: {error}");
    }
}

async fn run_transfer(
    ctx: &AppContext,
    mut request: TransferRequest,
    network: Option<NetworkClass>,
) -> Result<()> {
    if let Some(network) = network {
        request = request.network(network);
    }
    let observer = ctx
        .coordinator
        .start(request)
        .await
        .context("Failed to start transfer")?;
    println!("Transfer {} started", observer.id());

    match wait_or_interrupt(&observer).await? {
        Some(TransferState::Completed) => {
            println!("Transfer {} completed ({} bytes)", observer.id(), observer.bytes_total());
            Ok(())
        }
        Some(state) => bail!("Transfer {} ended {}", observer.id(), state),
        None => {
            println!("Interrupted, run `hauler recover` to continue");
            Ok(())
        }
    }
}

async fn run_recover(ctx: &AppContext) -> Result<()> {
    let ids = ctx
        .coordinator
        .recover_pending_on_startup()
        .await
        .context("Failed to recover pending transfers")?;
    if ids.is_empty() {
        println!("No pending transfers");
        return Ok(());
    }

    let mut failed = 0;
    for id in ids {
        let observer = ctx.coordinator.observer(id).await?;
        if observer.state() == TransferState::Paused {
            println!("[{id}] paused, skipping");
            continue;
        }
        match wait_or_interrupt(&observer).await? {
            Some(TransferState::Completed) => {}
            Some(_) => failed += 1,
            None => {
                println!("Interrupted, run `hauler recover` to continue");
                return Ok(());
            }
        }
    }
    if failed > 0 {
        bail!("{failed} transfer(s) did not complete");
    }
    Ok(())
}

/// Waits for a terminal state. `None` when Ctrl-C came first.
async fn wait_or_interrupt(observer: &TransferObserver) -> Result<Option<TransferState>> {
    observer.set_listener(Arc::new(ConsoleListener));
    tokio::select! {
        state = observer.wait_for_terminal(WAIT_FOREVER) => Ok(state),
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context("Failed to listen for Ctrl-C")?;
            info!("Interrupt received, stopping transfers");
            Ok(None)
        }
    }
}

async fn run_status(ctx: &AppContext, id: Option<TransferId>) -> Result<()> {
    let Some(id) = id else {
        let records = ctx.records.list().await?;
        if records.is_empty() {
            println!("No transfers");
        }
        for record in records {
            println!(
                "{:>5}  {:<8}  {:<26}  {:>12}/{:<12}  {}/{}",
                record.id,
                record.direction.as_str(),
                record.state.as_str(),
                record.bytes_current,
                record.bytes_total,
                record.bucket,
                record.key
            );
        }
        return Ok(());
    };

    let Some(record) = ctx.records.get(id).await? else {
        bail!("No transfer with id {id}");
    };
    println!("{}", serde_json::to_string_pretty(&record)?);

    if let Some(sqlite) = &ctx.sqlite {
        for entry in sqlite.history(id).await? {
            println!(
                "{}  {:<26}  {}",
                entry.created_at,
                entry.state,
                entry.description.unwrap_or_default()
            );
        }
    }
    Ok(())
}
