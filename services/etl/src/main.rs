use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use detection_classifier::SourceType;
use detection_etl::config::ServiceConfig;
use detection_etl::{
    BatchManager, BatchScheduler, Config, DataExtractor, DataTransformer, EtlPipeline, PgWarehouse,
    RunOutcome, WarehouseLoader,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "detection-etl",
    about = "Batch staged object detections into the warehouse",
    version
)]
struct Cli {
    /// Path to a configuration file (TOML, YAML or JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Source types to process
    #[arg(long, value_enum, default_value_t = SourceArg::All)]
    source_type: SourceArg,

    /// Keep running and poll the batch triggers
    #[arg(long)]
    daemon: bool,

    /// Ignore the batch triggers for a one-shot run
    #[arg(long)]
    force: bool,

    /// Create the warehouse table and exit
    #[arg(long)]
    init_warehouse: bool,

    /// Clear the pipeline state and exit
    #[arg(long)]
    reset_state: bool,

    /// Print pipeline, staging and warehouse statistics and exit
    #[arg(long)]
    stats: bool,

    /// Delete warehouse rows older than the retention period and exit
    #[arg(long)]
    cleanup: bool,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceArg {
    Video,
    Image,
    All,
}

impl SourceArg {
    fn source_types(self) -> Vec<SourceType> {
        match self {
            SourceArg::Video => vec![SourceType::Video],
            SourceArg::Image => vec![SourceType::Image],
            SourceArg::All => SourceType::ALL.to_vec(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(level) = &cli.log_level {
        config.service.log_level = level.clone();
    }
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.service);

    info!(service = %config.service.name, "Starting detection ETL");

    if cli.reset_state {
        let mut batch_manager = BatchManager::new(&config.batching).context("Failed to load pipeline state")?;
        batch_manager.reset_state().context("Failed to reset pipeline state")?;
        return Ok(());
    }

    let warehouse = Arc::new(
        PgWarehouse::connect(&config.warehouse)
            .await
            .context("Failed to connect to warehouse")?,
    );
    let loader = WarehouseLoader::new(warehouse, config.warehouse.insert_chunk_size);

    if cli.init_warehouse {
        loader.init_warehouse().await.context("Failed to create warehouse table")?;
        return Ok(());
    }

    if cli.cleanup {
        let deleted = loader
            .cleanup_old_data(config.warehouse.retention_days)
            .await
            .context("Failed to clean up warehouse")?;
        println!("Deleted {} rows older than {} days", deleted, config.warehouse.retention_days);
        return Ok(());
    }

    let batch_manager = BatchManager::new(&config.batching).context("Failed to load pipeline state")?;
    let extractor = DataExtractor::new(&config.staging.dir).context("Failed to open staging directory")?;

    if cli.stats {
        let report = json!({
            "pipeline": batch_manager.statistics(),
            "staging": extractor.staging_summary()?,
            "warehouse": loader.table_stats().await?,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let pipeline = EtlPipeline::new(
        batch_manager,
        extractor,
        Box::new(DataTransformer::new(&config.transform)),
        loader,
    );

    if cli.daemon {
        run_daemon(pipeline, &config, cli.source_type.source_types()).await
    } else {
        run_once(pipeline, cli.source_type.source_types(), cli.force).await
    }
}

async fn run_daemon(pipeline: EtlPipeline, config: &Config, source_types: Vec<SourceType>) -> Result<()> {
    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let mut scheduler = BatchScheduler::new(pipeline, config.batching.check_interval(), source_types);
    let stop = scheduler.stop_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Stopping after the current iteration");
        stop.stop();
    });

    scheduler.run().await;
    info!("Detection ETL stopped");
    Ok(())
}

async fn run_once(mut pipeline: EtlPipeline, source_types: Vec<SourceType>, force: bool) -> Result<()> {
    let mut failed = Vec::new();

    for source_type in source_types {
        match pipeline.run(source_type, force).await {
            Ok(RunOutcome::Loaded { files, rows_extracted, rows_loaded, stats }) => {
                println!(
                    "{}: loaded {} of {} rows from {} files ({} removed by transform)",
                    source_type,
                    rows_loaded,
                    rows_extracted,
                    files.len(),
                    stats.rows_removed
                );
            }
            Ok(outcome) => println!("{}: {:?}", source_type, outcome),
            Err(_) => failed.push(source_type),
        }
    }

    if !failed.is_empty() {
        bail!("Pipeline failed for {:?}", failed);
    }
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(config: &ServiceConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if config.log_format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
