//! Sceneshard Ingest - partitioned scene ingestion tool

use anyhow::{Context, Result};
use clap::Parser;
use sceneshard_common::logging::{init_logging, LogConfig, LogLevel};
use sceneshard_common::NameNormalizer;
use sceneshard_ingest::config::{create_pool, DbConfig, IngestConfig, DEFAULT_WORK_DIR};
use sceneshard_ingest::manifest::load_manifest;
use sceneshard_ingest::orchestrator::{show_statistics, BatchOrchestrator, OrchestratorConfig, RunMode};
use sceneshard_ingest::sources::{PgGeometrySource, PgMetadataSource};
use sceneshard_ingest::store::PgShardStore;
use sceneshard_ingest::view::{ViewConfig, ViewVariant};
use sqlx::PgPool;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Conventional exit status for a run stopped by SIGINT
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "sceneshard-ingest")]
#[command(author, version, about = "Partitioned, resumable scene ingestion into PostGIS shard tables")]
struct Cli {
    /// Manifest of dataset/token pairs (.json, .jsonl, .csv, .tsv or text)
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Tokens per pipeline batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Rows per INSERT statement
    #[arg(long)]
    insert_batch_size: Option<usize>,

    /// Directory holding the progress ledgers
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Fail datasets whose shard table does not exist yet
    #[arg(long)]
    no_create_tables: bool,

    /// Only reprocess tokens whose last recorded outcome is a failure
    #[arg(long)]
    retry_failed: bool,

    /// Print ledger statistics and exit without touching the database
    #[arg(long)]
    stats: bool,

    /// Process datasets one after another or on a worker pool
    #[arg(long, value_enum, default_value_t = RunMode::Sequential)]
    mode: RunMode,

    /// Worker count for parallel mode
    #[arg(long)]
    workers: Option<usize>,

    /// Name of the unified view
    #[arg(long)]
    view_name: Option<String>,

    /// View variants to rebuild after the run
    #[arg(long, value_enum, num_args = 1.., default_values_t = [ViewVariant::Plain])]
    view_variant: Vec<ViewVariant>,

    /// Do not rebuild the unified view
    #[arg(long)]
    skip_view: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging based on verbose flag
    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("sceneshard-ingest")
        .build()
        .with_env_overrides()?;

    init_logging(&log_config)?;

    if cli.stats {
        return print_statistics(&cli);
    }

    let manifest_path = cli
        .manifest
        .clone()
        .context("--manifest is required unless --stats is given")?;

    let config = apply_overrides(IngestConfig::from_env()?, &cli);
    config.validate()?;

    let manifest = load_manifest(&manifest_path)?;

    let shard_pool = create_pool(&config.database)
        .await
        .context("Failed to connect to the shard database")?;
    let warehouse_pool = source_pool(&config.database, &config.warehouse_url, &shard_pool)
        .await
        .context("Failed to connect to the metadata warehouse")?;
    let spatial_pool = source_pool(&config.database, &config.spatial_url, &shard_pool)
        .await
        .context("Failed to connect to the spatial database")?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let orchestrator_config = OrchestratorConfig {
        mode: cli.mode,
        workers: cli.workers,
        create_if_absent: !cli.no_create_tables,
        retry_failed_only: cli.retry_failed,
        view: (!cli.skip_view)
            .then(|| ViewConfig::new(config.view_name.clone()).with_variants(cli.view_variant.clone())),
        show_progress: cli.mode == RunMode::Sequential,
        ..OrchestratorConfig::from_ingest_config(&config)
    };

    let orchestrator = BatchOrchestrator::new(
        orchestrator_config,
        Arc::new(PgMetadataSource::new(warehouse_pool, config.metadata_table.clone())),
        Arc::new(PgGeometrySource::new(spatial_pool, config.points_table.clone(), config.min_points)),
        Arc::new(PgShardStore::new(shard_pool)),
        cancel,
    )
    .with_pool_size(config.database.max_connections);

    let summary = orchestrator.run(manifest).await?;
    println!("{}", summary);

    if summary.interrupted {
        info!("Run interrupted; progress flushed");
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }

    info!("Ingestion complete");
    Ok(ExitCode::SUCCESS)
}

fn apply_overrides(mut config: IngestConfig, cli: &Cli) -> IngestConfig {
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(insert_batch_size) = cli.insert_batch_size {
        config.insert_batch_size = insert_batch_size;
    }
    if let Some(work_dir) = &cli.work_dir {
        config.work_dir = work_dir.clone();
    }
    if let Some(view_name) = &cli.view_name {
        config.view_name = view_name.clone();
    }
    config
}

fn print_statistics(cli: &Cli) -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let work_dir = cli
        .work_dir
        .clone()
        .or_else(|| std::env::var("SCENESHARD_WORK_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR));

    let manifest = cli.manifest.as_deref().map(load_manifest).transpose()?;
    let report = show_statistics(&work_dir, manifest, &NameNormalizer::default())?;
    print!("{}", report);
    Ok(ExitCode::SUCCESS)
}

/// Reuse the shard pool when the source lives in the same database
async fn source_pool(shard: &DbConfig, url: &str, shard_pool: &PgPool) -> Result<PgPool> {
    if url == shard.url {
        return Ok(shard_pool.clone());
    }
    Ok(create_pool(&shard.with_url(url)).await?)
}

/// Trip `cancel` on Ctrl+C or SIGTERM
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing current batches");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing current batches");
        },
    }

    cancel.cancel();
}
