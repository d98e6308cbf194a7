//! tiercache server
//!
//! Runs a two-tier cache with its periodic optimizer and exposes Prometheus
//! metrics and health endpoints.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          tiercache                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    Seed      │───▶│ TieredCache  │◀───│  Optimizer   │       │
//! │  │   Warmup     │    │              │    │  (interval)  │       │
//! │  └──────────────┘    └──────┬───────┘    └──────────────┘       │
//! │                             │                                   │
//! │                   /metrics  /healthz  /readyz                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
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

use tiercache::cache::{CacheOptions, Optimizer, TieredCache};
use tiercache::error::{Error, Result};
use tiercache::{create_shared_backend, read_seed_file, CacheExporter, CacheSettings, SharedBackendKind};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - two-tier read-through/write-through cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML settings file
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Redis URL; selects the Redis shared backend
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Shared tier call timeout in milliseconds
    #[arg(long, env = "SHARED_TIMEOUT_MS")]
    shared_timeout_ms: Option<u64>,

    /// Population timeout in milliseconds
    #[arg(long, env = "POPULATION_TIMEOUT_MS")]
    population_timeout_ms: Option<u64>,

    /// Seconds between optimizer passes
    #[arg(long, env = "OPTIMIZE_INTERVAL_SECS")]
    optimize_interval_secs: Option<u64>,

    /// JSON object of key/value pairs loaded at startup
    #[arg(long, env = "TIERCACHE_SEED")]
    seed: Option<PathBuf>,

    /// Metrics and health server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// File settings (or defaults) with command-line overrides applied
    fn settings(&self) -> Result<CacheSettings> {
        let mut settings = match &self.config {
            Some(path) => CacheSettings::from_file(path)?,
            None => CacheSettings::default(),
        };

        if let Some(url) = &self.redis_url {
            settings.shared.backend = SharedBackendKind::Redis;
            settings.shared.redis_url = url.clone();
        }
        if let Some(ms) = self.shared_timeout_ms {
            settings.shared.timeout_ms = ms;
        }
        if let Some(ms) = self.population_timeout_ms {
            settings.population.timeout_ms = ms;
        }
        if let Some(secs) = self.optimize_interval_secs {
            settings.optimizer.interval_secs = secs;
        }

        settings.validate()?;
        Ok(settings)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let settings = args.settings()?;

    info!("Starting tiercache");
    info!("  Shared backend: {:?}", settings.shared.backend);
    info!("  Local TTL cap: {}s", settings.local.ttl_cap_secs);
    info!("  Shared timeout: {}ms", settings.shared.timeout_ms);
    info!("  Population timeout: {}ms", settings.population.timeout_ms);
    info!("  Optimizer interval: {}s", settings.optimizer.interval_secs);

    let backend = create_shared_backend(&settings.shared).await;
    let cache = Arc::new(TieredCache::with_config(settings.cache_config(), backend));

    if let Some(path) = &args.seed {
        warmup_from_seed(&cache, path).await?;
    }

    let shutdown = CancellationToken::new();
    let optimizer = Optimizer::new(Arc::clone(&cache), settings.optimizer.interval()).spawn(shutdown.clone());

    let exporter = CacheExporter::new()?;
    let server_cache = Arc::clone(&cache);
    let server_shutdown = shutdown.clone();
    let metrics_addr = args.metrics_addr.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, server_cache, exporter, server_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Internal(format!("failed to listen for ctrl-c: {}", e)))?;
    info!("Shutdown requested");

    shutdown.cancel();
    for (name, handle) in [("optimizer", optimizer), ("metrics server", server)] {
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!("{} did not stop within 5s", name);
        }
    }

    let stats = cache.stats();
    info!(
        hit_rate = stats.hit_rate,
        local_entries = stats.local.entries,
        shared_failures = stats.shared.failures,
        "tiercache shutdown complete"
    );
    Ok(())
}

async fn warmup_from_seed(cache: &TieredCache, path: &Path) -> Result<()> {
    let seed = read_seed_file(path)?;
    info!("Warming up {} keys from {}", seed.len(), path.display());

    let items: Vec<_> = seed
        .into_iter()
        .map(|(key, value)| (key, move || async move { Ok::<_, anyhow::Error>(value) }))
        .collect();

    let report = cache.warmup(items, &CacheOptions::default()).await;
    if !report.is_clean() {
        warn!(failed = ?report.failed, "Some seed keys were not cached");
    }
    Ok(())
}

// =============================================================================
// Logging Setup
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

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "redis=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

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

// =============================================================================
// Metrics & Health Server
// =============================================================================

fn text_response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn route(
    req: Request<hyper::body::Incoming>,
    cache: Arc<TieredCache>,
    exporter: CacheExporter,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            exporter.update(&cache.stats());
            match exporter.encode() {
                Ok(body) => text_response(StatusCode::OK, exporter.content_type(), body),
                Err(e) => {
                    error!("Failed to encode metrics: {}", e);
                    text_response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "metrics unavailable")
                }
            }
        }
        "/healthz" | "/livez" => text_response(StatusCode::OK, "text/plain", "ok"),
        "/readyz" => {
            if cache.shared().ping().await {
                text_response(StatusCode::OK, "text/plain", "ok")
            } else {
                text_response(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "shared tier unavailable")
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "not found"),
    };
    Ok(response)
}

async fn run_metrics_server(
    addr: &str,
    cache: Arc<TieredCache>,
    exporter: CacheExporter,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Metrics server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?,
        };

        let io = TokioIo::new(stream);
        let cache = Arc::clone(&cache);
        let exporter = exporter.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| route(req, Arc::clone(&cache), exporter.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
