//! Daemon for the chunkdb metrics store.
//!
//! Loads configuration from (in precedence order): defaults, config file, environment variables
//! (`CHUNKDB_*`), and CLI flags. Builds the chunk manager, runs the lifecycle worker, optionally
//! ingests a metrics file, serves health/readiness endpoints, and runs until graceful shutdown
//! (SIGINT/SIGTERM).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use std::convert::Infallible;

use bytes::Bytes;
use chunkdb::encoding::BlockCompression;
use chunkdb::storage::ReadOnlyStoreConfig;
use chunkdb::telemetry::{StoreEventListener, TracingEventListener};
use chunkdb::{
    ChunkLifecycleTask, ChunkManager, ChunkManagerConfig, FileMetricWriter, LifecycleConfig,
    LifecycleWorker,
};
use clap::Parser;
use config::{Config, Environment, File};
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::graceful::GracefulShutdown;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "chunkdbd.toml";
const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";

// ---------- CLI ----------

/// chunkdb metrics store daemon.
#[derive(Parser, Debug)]
#[command(name = "chunkdbd", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, `./chunkdbd.toml` is loaded when it exists.
    #[arg(long, env = "CHUNKDB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Load and validate config (file + env + CLI), print the effective settings, then exit.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    /// HTTP listen address for health/readiness endpoints (e.g. 127.0.0.1:8080).
    #[arg(long, env = "CHUNKDB_HTTP_BIND")]
    pub http_bind: Option<String>,

    /// Override the dataset prefix used in chunk names.
    #[arg(long)]
    pub dataset: Option<String>,

    /// Directory for read-only chunk spill files. Read-only chunks stay in memory when unset.
    #[arg(long)]
    pub spill_dir: Option<PathBuf>,

    /// File of `put` lines to ingest once at startup.
    #[arg(long)]
    pub ingest_file: Option<PathBuf>,
}

// ---------- File/env config (all optional for partial config) ----------

/// Top-level daemon config as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct DaemonFileConfig {
    pub dataset: Option<String>,
    /// HTTP listen address for /healthz and /readyz (e.g. "127.0.0.1:8080").
    pub http_bind: Option<String>,
    pub chunk_duration_secs: Option<i64>,
    pub metrics_delay_secs: Option<i64>,
    pub stale_data_delay_secs: Option<i64>,
    pub lifecycle_interval_secs: Option<u64>,
    pub spill_dir: Option<String>,
    /// Table form in TOML: `[compression]` with `type = "none" | "lz4"` or `type = "zstd", level = 3`.
    pub compression: Option<BlockCompression>,
    pub ingest_file: Option<String>,
}

/// Everything the daemon needs, merged from config + env + CLI.
#[derive(Debug)]
pub struct DaemonSettings {
    pub manager: ChunkManagerConfig,
    pub lifecycle: LifecycleConfig,
    pub http_bind: SocketAddr,
    pub ingest_file: Option<PathBuf>,
}

/// Parse `http_bind` string to `SocketAddr`. Returns error message on failure.
fn parse_http_bind(s: &str) -> Result<SocketAddr, String> {
    s.parse::<SocketAddr>()
        .map_err(|e| format!("invalid http_bind {:?}: {}", s, e))
}

/// Load merged settings. CLI overrides file/env.
fn load_daemon_config(cli: &Cli) -> Result<DaemonSettings, String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(false));
        } else {
            let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("CHUNKDB")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: DaemonFileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let mut manager = ChunkManagerConfig {
        event_listener: Arc::new(TracingEventListener),
        ..ChunkManagerConfig::default()
    };
    let mut lifecycle = LifecycleConfig::default();
    merge_into_configs(&mut manager, &mut lifecycle, &partial);

    if let Some(ref d) = cli.dataset {
        manager.dataset = d.clone();
    }
    if let Some(ref dir) = cli.spill_dir {
        manager.read_only.spill_dir = Some(dir.clone());
    }
    manager.validate().map_err(|e| e.to_string())?;
    lifecycle.validate().map_err(|e| e.to_string())?;

    let http_bind_str = cli
        .http_bind
        .as_deref()
        .or(partial.http_bind.as_deref())
        .unwrap_or(DEFAULT_HTTP_BIND);
    let http_bind = parse_http_bind(http_bind_str)?;

    let ingest_file = cli
        .ingest_file
        .clone()
        .or_else(|| partial.ingest_file.as_ref().map(PathBuf::from));

    Ok(DaemonSettings {
        manager,
        lifecycle,
        http_bind,
        ingest_file,
    })
}

/// Merge file/env partial config. Only overwrites fields that are `Some`.
fn merge_into_configs(
    manager: &mut ChunkManagerConfig,
    lifecycle: &mut LifecycleConfig,
    partial: &DaemonFileConfig,
) {
    if let Some(s) = &partial.dataset {
        manager.dataset = s.clone();
    }
    if let Some(secs) = partial.chunk_duration_secs {
        manager.chunk_duration_secs = secs;
    }
    if let Some(dir) = &partial.spill_dir {
        manager.read_only.spill_dir = Some(PathBuf::from(dir));
    }
    if let Some(c) = partial.compression {
        manager.read_only.compression = c;
    }
    if let Some(secs) = partial.metrics_delay_secs {
        lifecycle.metrics_delay_secs = secs;
    }
    if let Some(secs) = partial.stale_data_delay_secs {
        lifecycle.stale_data_delay_secs = secs;
    }
    if let Some(secs) = partial.lifecycle_interval_secs {
        lifecycle.run_interval = Duration::from_secs(secs);
    }
}

fn compression_name(c: BlockCompression) -> String {
    match c {
        BlockCompression::None => "none".to_string(),
        BlockCompression::Lz4 => "lz4".to_string(),
        BlockCompression::Zstd { level } => format!("zstd:{}", level),
    }
}

fn print_settings(settings: &DaemonSettings) {
    let ReadOnlyStoreConfig {
        spill_dir,
        compression,
    } = &settings.manager.read_only;
    println!("dataset={}", settings.manager.dataset);
    println!("chunk_duration_secs={}", settings.manager.chunk_duration_secs);
    println!("metrics_delay_secs={}", settings.lifecycle.metrics_delay_secs);
    println!("stale_data_delay_secs={}", settings.lifecycle.stale_data_delay_secs);
    println!(
        "lifecycle_interval_secs={}",
        settings.lifecycle.run_interval.as_secs()
    );
    match spill_dir {
        Some(dir) => println!("spill_dir={}", dir.display()),
        None => println!("spill_dir="),
    }
    println!("compression={}", compression_name(*compression));
    println!("http_bind={}", settings.http_bind);
    match &settings.ingest_file {
        Some(path) => println!("ingest_file={}", path.display()),
        None => println!("ingest_file="),
    }
}

// ---------- Health HTTP server ----------

/// Shared state for the health service (readiness flag only).
struct HealthState {
    ready: Arc<AtomicBool>,
}

async fn health_service(
    state: Arc<HealthState>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (status, body) = match (req.method(), req.uri().path()) {
        (&hyper::Method::GET, "/healthz") => (hyper::StatusCode::OK, Bytes::from("ok")),
        (&hyper::Method::GET, "/readyz") => {
            // Not ready until the startup ingest file has been consumed.
            if state.ready.load(Ordering::Acquire) {
                (hyper::StatusCode::OK, Bytes::from("ok"))
            } else {
                (
                    hyper::StatusCode::SERVICE_UNAVAILABLE,
                    Bytes::from("not ready"),
                )
            }
        }
        _ => (hyper::StatusCode::NOT_FOUND, Bytes::from("not found")),
    };
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    Ok(response)
}

/// Returns a future that completes when SIGINT (Ctrl+C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl_c handler failed");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

/// Runs the daemon: spawns the health HTTP server, waits for shutdown signal, then stops the
/// lifecycle worker.
async fn run_with_health_server(
    manager: Arc<ChunkManager>,
    worker: LifecycleWorker,
    http_bind: SocketAddr,
    ready: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(http_bind)
        .await
        .map_err(|e| format!("failed to bind {}: {}", http_bind, e))?;
    tracing::info!(
        dataset = %manager.config().dataset,
        http = %http_bind,
        "chunkdbd running, press Ctrl+C or send SIGTERM to stop"
    );

    let state = Arc::new(HealthState { ready });
    let server = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();
    let mut shutdown = std::pin::pin!(shutdown_signal());

    loop {
        tokio::select! {
            Ok((stream, _addr)) = listener.accept() => {
                let io = TokioIo::new(Box::pin(stream));
                let state = Arc::clone(&state);
                let conn = server.serve_connection_with_upgrades(io, service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { health_service(state, req).await }
                }));
                let fut = graceful.watch(conn.into_owned());
                tokio::spawn(async move {
                    if let Err(e) = fut.await {
                        tracing::debug!(error = ?e, "health connection error");
                    }
                });
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    drop(listener);
    const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
    tokio::select! {
        _ = graceful.shutdown() => {
            tracing::debug!("all health connections closed");
        }
        _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
            tracing::warn!("shutdown timeout waiting for connections");
        }
    }

    tracing::info!("stopping lifecycle worker");
    tokio::task::spawn_blocking(move || worker.shutdown()).await??;
    let stats = manager.stats();
    tracing::info!(
        chunks = stats.mutable_chunks + stats.read_only_chunks,
        metrics = stats.metrics,
        points = stats.points,
        "shutdown complete"
    );
    Ok(())
}

// ---------- Main ----------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = load_daemon_config(&cli).map_err(|e| {
        tracing::error!(error = %e, "config error");
        e
    })?;

    if cli.validate_config {
        print_settings(&settings);
        return Ok(());
    }

    let events: Arc<dyn StoreEventListener> = Arc::clone(&settings.manager.event_listener);
    let manager = Arc::new(ChunkManager::new(settings.manager).map_err(|e| {
        tracing::error!(error = %e, "failed to create chunk manager");
        e
    })?);

    let task = ChunkLifecycleTask::new(Arc::clone(&manager), &settings.lifecycle)?;
    let worker = LifecycleWorker::spawn(task, settings.lifecycle.run_interval, Arc::clone(&events))?;

    let ready = Arc::new(AtomicBool::new(settings.ingest_file.is_none()));
    if let Some(path) = settings.ingest_file {
        let writer = FileMetricWriter::new(path, Arc::clone(&manager)).with_event_listener(events);
        let ready = Arc::clone(&ready);
        tokio::task::spawn_blocking(move || {
            match writer.ingest() {
                Ok(report) => tracing::info!(
                    path = %writer.path().display(),
                    ingested = report.ingested,
                    invalid = report.invalid,
                    late = report.late,
                    failed = report.failed,
                    "ingest file consumed"
                ),
                Err(e) => tracing::error!(path = %writer.path().display(), error = %e, "ingest file failed"),
            }
            ready.store(true, Ordering::Release);
        });
    }

    run_with_health_server(manager, worker, settings.http_bind, ready).await
}
