//! Tiered Cache Service
//!
//! Runs the layered cache with its background loops and exposes health,
//! Prometheus metrics and a JSON stats view over HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Tiered Cache Service                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Warm-up    │───▶│ LayeredCache │◀───│   Adaptive   │       │
//! │  │ Coordinator  │    │  L1/L2/L3    │    │  Controller  │       │
//! │  └──────────────┘    └──────┬───────┘    └──────────────┘       │
//! │                             ▼                                    │
//! │                      Stats Reporter ──▶ /metrics, /stats         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiered_cache::cache::{
    encode_key, AdaptiveController, CacheBackend, CacheKey, InMemoryBackend, LayeredCache,
    WarmupCoordinator,
};
use tiered_cache::config::CacheConfig;
use tiered_cache::metrics::{MetricsExporter, StatsReporter};

type Cache = LayeredCache<Value>;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Tiered Cache - layered L1/L2/L3 cache service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file (defaults apply when omitted)
    #[arg(long, env = "CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the L1 entry capacity
    #[arg(long, env = "L1_MAX_ENTRIES")]
    l1_max_entries: Option<usize>,

    /// Disable the L2 tier
    #[arg(long, env = "DISABLE_L2")]
    disable_l2: bool,

    /// Disable the L3 tier
    #[arg(long, env = "DISABLE_L3")]
    disable_l3: bool,

    /// Skip the warm-up loop
    #[arg(long, env = "DISABLE_WARMUP")]
    disable_warmup: bool,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = load_config(&args)?;

    info!("Starting Tiered Cache");
    info!(
        "  L1: enabled={} ttl={:?} capacity={}",
        config.tiers.l1.enabled, config.tiers.l1.ttl, config.tiers.l1_max_entries
    );
    info!("  L2: enabled={} ttl={:?}", config.tiers.l2.enabled, config.tiers.l2.ttl);
    info!("  L3: enabled={} ttl={:?}", config.tiers.l3.enabled, config.tiers.l3.ttl);
    info!(
        "  Warm-up: enabled={} interval={:?} concurrency={}",
        config.warmup.enabled, config.warmup.interval, config.warmup.max_concurrency
    );
    info!(
        "  Adaptive: enabled={} target hit rate={}",
        config.adaptive.enabled, config.adaptive.target_hit_rate
    );

    let l2: Arc<dyn CacheBackend> = Arc::new(InMemoryBackend::new("l2-memory"));
    let l3: Arc<dyn CacheBackend> = Arc::new(InMemoryBackend::new("l3-memory"));
    let cache: Arc<Cache> = Arc::new(LayeredCache::with_backends(
        config.clone(),
        Some(l2),
        Some(l3),
    ));

    let shutdown = CancellationToken::new();
    let exporter = Arc::new(MetricsExporter::new().context("failed to register metrics")?);

    let warmup = Arc::new(WarmupCoordinator::new(config.warmup.clone()));
    register_warmup_jobs(&warmup, &cache);
    info!("Registered warm-up schedule: {:?}", warmup.schedule());

    let adaptive = Arc::new(AdaptiveController::new(cache.clone()));
    let reporter = Arc::new(
        StatsReporter::new(cache.clone(), config.metrics.clone())
            .with_exporter(exporter.clone())
            .with_warmup(warmup.clone()),
    );

    let mut handles = vec![
        tokio::spawn(adaptive.run(shutdown.clone())),
        tokio::spawn(warmup.clone().run(shutdown.clone())),
        tokio::spawn(reporter.run(shutdown.clone())),
    ];

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_shutdown = shutdown.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = serve("Health", &health_addr, health_shutdown, health_response).await {
            error!("Health server error: {:#}", e);
        }
    }));

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_shutdown = shutdown.clone();
    let state = MetricsState {
        cache: cache.clone(),
        exporter,
        warmup,
    };
    handles.push(tokio::spawn(async move {
        let handler = move |req: Request<Incoming>| state.respond(&req);
        if let Err(e) = serve("Metrics", &metrics_addr, metrics_shutdown, handler).await {
            error!("Metrics server error: {:#}", e);
        }
    }));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    shutdown.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Background task failed: {}", e);
        }
    }

    info!("Tiered Cache shutdown complete");
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => CacheConfig::default(),
    };

    if let Some(capacity) = args.l1_max_entries {
        config.tiers.l1_max_entries = capacity;
    }
    if args.disable_l2 {
        config.tiers.l2.enabled = false;
    }
    if args.disable_l3 {
        config.tiers.l3.enabled = false;
    }
    if args.disable_warmup {
        config.warmup.enabled = false;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

// =============================================================================
// Warm-up Jobs
// =============================================================================

const SYMBOLS: [&str; 4] = ["BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT"];

fn register_warmup_jobs(warmup: &WarmupCoordinator, cache: &Arc<Cache>) {
    let c = cache.clone();
    warmup.register_fn("market-snapshots", 10, Duration::from_secs(30), move |ctx| {
        let cache = c.clone();
        async move {
            for symbol in SYMBOLS {
                let key = encode_key("market", "ticker", [("symbol", symbol)]);
                let snapshot = json!({ "symbol": symbol, "warmed_at": Utc::now() });
                cache.set(&ctx, &key, snapshot, None).await?;
            }
            Ok(())
        }
    });

    let c = cache.clone();
    warmup.register_fn("popular-symbols", 7, Duration::from_secs(15), move |ctx| {
        let cache = c.clone();
        async move {
            let key = encode_key("market", "popular", [("limit", SYMBOLS.len())]);
            cache.set(&ctx, &key, json!(SYMBOLS), None).await
        }
    });

    let c = cache.clone();
    warmup.register_fn("service-config", 5, Duration::from_secs(5), move |ctx| {
        let cache = c.clone();
        async move {
            let key = CacheKey::new("config", "service").encode();
            let value = json!({ "version": env!("CARGO_PKG_VERSION") });
            cache.set(&ctx, &key, value, Some(Duration::from_secs(3600))).await
        }
    });
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
    for directive in ["hyper=warn", "tower=warn"] {
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
// HTTP Servers
// =============================================================================

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn not_found() -> Response<Full<Bytes>> {
    response(StatusCode::NOT_FOUND, "text/plain", "not found")
}

fn health_response(req: Request<Incoming>) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/healthz" | "/livez" | "/readyz" => response(StatusCode::OK, "text/plain", "ok"),
        _ => not_found(),
    }
}

struct MetricsState {
    cache: Arc<Cache>,
    exporter: Arc<MetricsExporter>,
    warmup: Arc<WarmupCoordinator>,
}

impl MetricsState {
    fn respond(&self, req: &Request<Incoming>) -> Response<Full<Bytes>> {
        match req.uri().path() {
            "/metrics" => {
                self.exporter.update(&self.cache.get_stats());
                match self.exporter.encode_text() {
                    Ok(text) => response(StatusCode::OK, prometheus::TEXT_FORMAT, text),
                    Err(e) => {
                        error!("Failed to encode metrics: {}", e);
                        response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string())
                    }
                }
            }
            "/stats" => {
                let body = json!({
                    "cache": self.cache.get_stats(),
                    "warmup": self.warmup.last_report(),
                });
                response(StatusCode::OK, "application/json", body.to_string())
            }
            _ => not_found(),
        }
    }
}

async fn serve<H>(
    name: &'static str,
    addr: &str,
    shutdown: CancellationToken,
    handler: H,
) -> anyhow::Result<()>
where
    H: Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
{
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid {} server address: {}", name, addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {} server", name))?;

    info!("{} server listening on {}", name, addr);

    let handler = Arc::new(handler);
    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("{} server shutting down", name);
                return Ok(());
            }
            accepted = listener.accept() => {
                accepted.with_context(|| format!("{} server accept error", name))?
            }
        };

        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>((*handler)(req)) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("{} server connection error: {}", name, e);
            }
        });
    }
}
