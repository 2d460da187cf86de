//! GeoPDF Conversion Worker Service
//!
//! Accepts GeoJSON conversion jobs over HTTP and processes them on a pool
//! of workers that shell out to GDAL's `ogr2ogr`.
//!
//! ## Architecture
//!
//! - **Records**: Redis keys (`{prefix}:job:{id}`), updated by compare-and-swap
//! - **Intake**: Redis list (`{prefix}:queue`)
//! - **Converter**: `ogr2ogr -f PDF`
//! - **Telemetry**: OpenTelemetry OTLP export
//!
//! ## Configuration
//!
//! Environment variables (see `config.rs` for the full list):
//! - `REDIS_URL`: Redis connection string (default: redis://127.0.0.1/)
//! - `HTTP_ADDR`: API listen address (default: 0.0.0.0:8080)
//! - `WORKER_CONCURRENCY`: Number of concurrent workers (default: 4)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector endpoint
//! - `RUST_LOG`: Log level (default: info)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use redis::Client;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use geopdf_worker::{
    artifact::ArtifactStore,
    config::Config,
    converter::{Ogr2OgrConverter, PDF_DRIVER},
    executor::Executor,
    gateway::SubmissionGateway,
    http,
    queue::{JobQueue, RedisJobQueue},
    reconcile::Reconciler,
    store::{JobLedger, RedisJobStore},
    telemetry,
    workspace::WorkspaceManager,
};

/// GeoJSON to PDF conversion service
#[derive(Parser, Debug)]
#[command(name = "geopdf-worker", version)]
#[command(about = "Durable GeoJSON to PDF conversion service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Serve the HTTP API only
    Serve,
    /// Process jobs only
    Work,
    /// Serve the API and process jobs (default)
    Run,
}

impl Command {
    fn serves_http(self) -> bool {
        matches!(self, Command::Serve | Command::Run)
    }

    fn runs_executor(self) -> bool {
        matches!(self, Command::Work | Command::Run)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    let config = Config::from_env().context("Failed to load configuration")?;
    telemetry::init_tracing(config.log_format);

    if let Err(e) = telemetry::init_telemetry() {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!(?command, "Starting GeoPDF worker service");
    info!(
        "Configuration: redis_url={}, prefix={}, concurrency={}, max_attempts={}",
        config.redis_url, config.key_prefix, config.concurrency, config.retry.max_attempts
    );

    let client = Client::open(config.redis_url.as_str())
        .context("Failed to create Redis client")?;
    let conn = redis::aio::ConnectionManager::new(client.clone())
        .await
        .context("Failed to connect to Redis")?;

    info!("Connected to Redis");

    let ledger = JobLedger::new(Arc::new(RedisJobStore::new(
        conn.clone(),
        config.key_prefix.clone(),
        config.terminal_ttl,
    )));
    let queue: Arc<dyn JobQueue> = Arc::new(RedisJobQueue::new(conn, client, &config.key_prefix));

    let shutdown = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<Result<()>>> = Vec::new();

    if command.runs_executor() {
        let converter = Ogr2OgrConverter::new(config.ogr2ogr_path.clone());
        match converter.require_driver(PDF_DRIVER) {
            Ok(()) => info!(program = %config.ogr2ogr_path.display(), "PDF driver available"),
            Err(e) => warn!("Converter probe failed, jobs will fail until it is fixed: {}", e),
        }

        let workspaces = WorkspaceManager::new(config.scratch_root.clone(), config.cleanup);
        Reconciler::new(
            ledger.clone(),
            queue.clone(),
            workspaces.clone(),
            config.retry.clone(),
            config.stale_after(),
        )
        .run()
        .await
        .context("Failed to reconcile job state")?;

        let executor = Executor::new(
            ledger.clone(),
            queue.clone(),
            Arc::new(converter),
            workspaces,
            ArtifactStore::new(config.artifact_root.clone()),
            config.executor_settings(),
        );
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            executor.run(token).await;
            Ok(())
        }));
    }

    if command.serves_http() {
        let listener = TcpListener::bind(config.http_addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.http_addr))?;
        info!("HTTP API listening on {}", config.http_addr);

        let app = http::router(SubmissionGateway::new(ledger.clone(), queue.clone()));
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
                .context("HTTP server failed")
        }));
    }

    info!("Service ready, press Ctrl+C to shutdown");
    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;

    info!("Received shutdown signal, waiting for in-flight work to finish...");
    shutdown.cancel();

    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Task failed during shutdown: {:#}", e),
            Err(e) => error!("Task panicked during shutdown: {}", e),
        }
    }

    telemetry::shutdown_telemetry();
    info!("Service shutdown complete");
    Ok(())
}
