//! tierio Worker - tiered block cache daemon
//!
//! This binary runs one worker with an in-process master, serving blocks
//! from its local tiers and writing through to the configured UFS root.

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tierio_client::InProcessMaster;
use tierio_common::{WorkerConfig, WorkerId};
use tierio_storage::BlockStore;
use tierio_ufs::LocalUfs;
use tierio_worker::WorkerHandle;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tierio-worker")]
#[command(about = "tierio tiered block worker")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/tierio/worker.toml", env = "TIERIO_CONFIG")]
    config: PathBuf,

    /// Hostname advertised for local-first placement
    #[arg(long, env = "TIERIO_HOSTNAME")]
    hostname: Option<String>,

    /// Under file system root directory
    #[arg(long)]
    ufs_root: Option<PathBuf>,

    /// Metrics server port (Prometheus)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Wipe every storage directory before starting
    #[arg(long)]
    format: bool,
}

/// Load the config file when present; CLI flags take precedence
fn load_config(args: &Args) -> Result<WorkerConfig> {
    let mut config: WorkerConfig = if args.config.exists() {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", args.config.display()))?
    } else {
        WorkerConfig::default()
    };

    if let Some(hostname) = &args.hostname {
        config.worker.hostname.clone_from(hostname);
    }
    if let Some(root) = &args.ufs_root {
        config.ufs.root.clone_from(root);
    }
    if let Some(port) = args.metrics_port {
        config.worker.metrics_port = port;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    if config.worker.id.is_none() {
        config.worker.id = Some(WorkerId::new());
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tierio worker");
    info!("Config file: {}", args.config.display());
    for tier in &config.tiers {
        let capacity: u64 = tier.dirs.iter().map(|d| d.capacity).sum();
        info!(tier = %tier.alias, dirs = tier.dirs.len(), capacity, "storage tier");
    }

    if args.format {
        BlockStore::format(&config.tiers)?;
    }
    let store = Arc::new(BlockStore::open(&config.tiers, &config.storage)?);
    std::fs::create_dir_all(&config.ufs.root)
        .with_context(|| format!("creating UFS root {}", config.ufs.root.display()))?;
    let ufs = Arc::new(LocalUfs::new(config.ufs.root.clone()));
    let master = Arc::new(InProcessMaster::new());

    let handle = WorkerHandle::start(&config, Arc::clone(&store), ufs, master);
    let worker_id = handle.worker_id().to_string();
    info!("Worker ID: {}", worker_id);

    let metrics_state = Arc::new(MetricsState {
        handle_metrics: Arc::clone(&handle.metrics),
        store,
        worker_id,
        start_time: Instant::now(),
    });
    let metrics_port = config.worker.metrics_port;
    let metrics_task = tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_port, metrics_state).await {
            error!("Metrics server error: {}", e);
        }
    });
    info!("Metrics available at http://0.0.0.0:{}/metrics", metrics_port);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    metrics_task.abort();
    handle.shutdown();

    info!("Worker shut down gracefully");
    Ok(())
}

/// State shared with the metrics HTTP handlers
struct MetricsState {
    handle_metrics: Arc<tierio_worker::WorkerMetrics>,
    store: Arc<BlockStore>,
    worker_id: String,
    start_time: Instant,
}

/// Metrics HTTP handler
async fn metrics_handler(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    let mut output = state
        .handle_metrics
        .export_prometheus(&state.worker_id, &state.store);
    output.push_str("# HELP tierio_worker_uptime_seconds Worker uptime in seconds\n");
    output.push_str("# TYPE tierio_worker_uptime_seconds counter\n");
    output.push_str(&format!(
        "tierio_worker_uptime_seconds{{worker_id=\"{}\"}} {}\n",
        state.worker_id,
        state.start_time.elapsed().as_secs()
    ));

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
}

/// Health check handler
async fn health_handler(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    let dirs_present = state
        .store
        .layout()
        .all_dirs()
        .all(|dir| dir.path().is_dir());

    if dirs_present {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "UNHEALTHY")
    }
}

/// Start the metrics HTTP server
async fn start_metrics_server(port: u16, state: Arc<MetricsState>) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    info!("Starting metrics server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
