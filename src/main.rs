//! StrataCache CLI
//!
//! Drives a size-tiered cache from the command line: preload batches, look
//! objects up, invalidate, clear, and serve Prometheus metrics.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          stratacache                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  preload │ get │ invalidate │ stats │ clear │ serve              │
//! │                        │                         │               │
//! │                   CacheService ◀── StatsExporter ┘               │
//! │             HttpOrigin │ RedisRemoteStore                         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use stratacache::adapters::{HttpOrigin, InMemoryOrigin, InMemoryRemoteStore, RedisRemoteStore};
use stratacache::domain::{OriginStore, RemoteStore};
use stratacache::monitoring::{HealthCheck, StatsExporter};
use stratacache::{CacheConfig, CacheService, InstrumentedCacheService};

// =============================================================================
// CLI Arguments
// =============================================================================

/// StrataCache - size-tiered multi-layer blob cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML, or JSON by extension)
    #[arg(long, env = "STRATACACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Filesystem layer directory (overrides the config file)
    #[arg(long, env = "STRATACACHE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Redis URL for the remote layer; in-process store when unset
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Origin base URL; objects are fetched from <origin-url>/<storage key>
    #[arg(long, env = "ORIGIN_URL")]
    origin_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Preload objects given as <uuid>=<storage key>
    Preload {
        #[arg(required = true, value_parser = parse_object)]
        objects: Vec<(Uuid, String)>,
    },
    /// Look an object up through the layer waterfall
    Get {
        id: Uuid,
        /// Write the object here instead of discarding it
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Remove an object from every layer
    Invalidate { id: Uuid },
    /// Print statistics as JSON
    Stats,
    /// Clear every layer
    Clear,
    /// Serve /metrics, /stats and /healthz until interrupted
    Serve {
        #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
        addr: SocketAddr,
        /// Seconds between statistics refreshes
        #[arg(long, env = "STATS_REFRESH_SECONDS", default_value = "15")]
        refresh_secs: u64,
    },
}

fn parse_object(raw: &str) -> Result<(Uuid, String), String> {
    let (id, key) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected <uuid>=<storage key>, got {:?}", raw))?;
    let id = Uuid::parse_str(id).map_err(|e| format!("invalid object id {:?}: {}", id, e))?;
    if key.is_empty() {
        return Err(format!("empty storage key for {}", id));
    }
    Ok((id, key.to_string()))
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(&args)?;
    let service = Arc::new(build_service(&args, &config).await?);

    let outcome = run(&args.command, Arc::clone(&service)).await;
    service.shutdown().await;
    outcome
}

async fn run(command: &Command, service: Arc<CacheService>) -> anyhow::Result<()> {
    match command {
        Command::Preload { objects } => {
            let (ids, keys): (Vec<Uuid>, Vec<String>) = objects.iter().cloned().unzip();
            let instrumented = InstrumentedCacheService::new(service);
            match instrumented.preload_objects_with_metrics(&ids, &keys).await {
                Ok(metrics) => println!("{}", metrics.summary()),
                Err(e) => {
                    println!("{}", e.metrics.summary());
                    return Err(e.source).context("preload finished with errors");
                }
            }
        }
        Command::Get { id, output } => {
            let mut stream = service.get_from_cache_stream(*id).await?;
            let copied = match output {
                Some(path) => {
                    let mut file = tokio::fs::File::create(path)
                        .await
                        .with_context(|| format!("creating {}", path.display()))?;
                    tokio::io::copy(&mut stream.reader, &mut file).await?
                }
                None => tokio::io::copy(&mut stream.reader, &mut tokio::io::sink()).await?,
            };
            if copied != stream.length {
                bail!("short read: {} of {} bytes", copied, stream.length);
            }
            println!("{} {} bytes from {}", id, copied, stream.layer);
        }
        Command::Invalidate { id } => {
            service.invalidate_object(*id).await?;
            println!("invalidated {}", id);
        }
        Command::Stats => {
            let stats = service.statistics().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Clear => {
            service.clear_cache().await?;
            println!("cleared all layers");
        }
        Command::Serve { addr, refresh_secs } => {
            serve(service, *addr, Duration::from_secs((*refresh_secs).max(1))).await?;
        }
    }
    Ok(())
}

// =============================================================================
// Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hyper=warn,redis=warn,reqwest=warn", level)));

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

fn load_config(args: &Args) -> anyhow::Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(dir) = &args.cache_dir {
        config.filesystem.base_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn build_service(args: &Args, config: &CacheConfig) -> anyhow::Result<CacheService> {
    let origin: Arc<dyn OriginStore> = match &args.origin_url {
        Some(url) => {
            info!("  Origin: {}", url);
            Arc::new(HttpOrigin::new(url.as_str())?)
        }
        None => {
            warn!("No origin configured; preloads and fills will fail");
            Arc::new(InMemoryOrigin::new())
        }
    };

    let remote: Arc<dyn RemoteStore> = match &args.redis_url {
        Some(url) => Arc::new(
            RedisRemoteStore::connect(url)
                .await
                .context("connecting to redis")?,
        ),
        None => {
            warn!("No redis configured; remote layer is process-local");
            Arc::new(InMemoryRemoteStore::new())
        }
    };

    info!("Starting StrataCache");
    info!("  Cache dir: {}", config.filesystem.base_dir.display());
    info!(
        "  Thresholds: {} / {} / {} bytes",
        config.thresholds.small, config.thresholds.medium, config.thresholds.large
    );

    Ok(CacheService::from_config(config, origin, remote).await?)
}

// =============================================================================
// Metrics & Health Server
// =============================================================================

struct ServerState {
    service: Arc<CacheService>,
    exporter: StatsExporter,
    health: HealthCheck,
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn route(req: Request<hyper::body::Incoming>, state: Arc<ServerState>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => match state.exporter.encode() {
            Ok(text) => respond(StatusCode::OK, "text/plain; version=0.0.4", text),
            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
        },
        "/stats" => match state.service.statistics().await {
            Ok(stats) => match serde_json::to_vec(&stats) {
                Ok(json) => respond(StatusCode::OK, "application/json", json),
                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
            },
            Err(e) => respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", e.to_string()),
        },
        "/healthz" | "/livez" => {
            let report = state.health.check(&state.service).await;
            let status = if report.status.is_operational() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            let body = serde_json::to_vec(&report).unwrap_or_default();
            respond(status, "application/json", body)
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    };
    Ok(response)
}

async fn serve(service: Arc<CacheService>, addr: SocketAddr, refresh: Duration) -> anyhow::Result<()> {
    let state = Arc::new(ServerState {
        service: Arc::clone(&service),
        exporter: StatsExporter::new()?,
        health: HealthCheck::new(),
    });

    let shutdown = CancellationToken::new();
    let refresher = {
        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            state
                .exporter
                .run(Arc::clone(&state.service), refresh, shutdown)
                .await;
        })
    };

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding metrics server to {}", addr))?;
    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted.context("metrics server accept")?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                break;
            }
        };

        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let handler = service_fn(move |req| route(req, Arc::clone(&state)));
            if let Err(e) = http1::Builder::new().serve_connection(io, handler).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }

    state.health.set_live(false);
    shutdown.cancel();
    let _ = refresher.await;
    Ok(())
}
