//! Core shared utilities for the predictor serving services.
//!
//! Tracing / OTLP export, Prometheus metrics exposition, the health server and the
//! layered dynamic configuration live here so every service boots the same way.

use anyhow::Result;
use tracing::info;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::RwLock;
use std::time::{Duration, Instant};
use std::path::PathBuf;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use notify::{RecommendedWatcher, Watcher, EventKind};
use axum::{http::{header, StatusCode}, response::IntoResponse, routing::get, Router};
use config::builder::{ConfigBuilder, DefaultState};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::SdkMeterProvider, trace::SdkTracerProvider, Resource};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use tracing_subscriber::{prelude::*, EnvFilter};

static OTEL_INIT: OnceCell<()> = OnceCell::new();
static TRACER_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();
static METER_PROVIDER: OnceCell<SdkMeterProvider> = OnceCell::new();
static CONFIG_CACHE: OnceCell<RwLock<CachedConfig>> = OnceCell::new();
static PROM_REGISTRY: Lazy<prometheus::Registry> = Lazy::new(prometheus::Registry::new);

static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);
pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { NODE_LIVENESS.store(false, Ordering::SeqCst); }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }
pub fn is_live() -> bool { NODE_LIVENESS.load(Ordering::SeqCst) }

#[derive(Debug, Clone)]
struct CachedConfig {
    cfg: DynamicConfig,
    fetched_at: Instant,
    ttl: Duration,
    file: Option<PathBuf>,
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` drives filtering, `SERVING_JSON_LOG=1` switches to flattened JSON lines and
/// a set `OTEL_EXPORTER_OTLP_ENDPOINT` adds a span exporter. Safe to call more than once.
pub fn init_tracing(service: &str) -> Result<()> {
    OTEL_INIT.get_or_try_init(|| -> Result<()> {
        let tracer = match std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            Ok(endpoint) => {
                let exporter = opentelemetry_otlp::SpanExporter::builder()
                    .with_tonic()
                    .with_endpoint(endpoint)
                    .build()?;
                let provider = SdkTracerProvider::builder()
                    .with_batch_exporter(exporter)
                    .with_resource(
                        Resource::builder().with_service_name(service.to_string()).build(),
                    )
                    .build();
                let tracer = provider.tracer(service.to_string());
                opentelemetry::global::set_tracer_provider(provider.clone());
                let _ = TRACER_PROVIDER.set(provider);
                Some(tracer)
            }
            Err(_) => None,
        };
        let json = std::env::var("SERVING_JSON_LOG")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let json_layer = json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
        });
        let plain_layer = (!json).then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
        });
        let otel_layer = tracer.map(|t| tracing_opentelemetry::layer().with_tracer(t));
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .with(plain_layer)
            .with(otel_layer)
            .try_init()?;
        Ok(())
    })?;
    info!(target: "serving_core", service, "tracing initialized");
    Ok(())
}

/// Flush pending spans and metrics. Call once on shutdown.
pub fn shutdown_telemetry() {
    if let Some(p) = TRACER_PROVIDER.get() {
        if let Err(e) = p.shutdown() {
            tracing::warn!(error=?e, "tracer provider shutdown failed");
        }
    }
    if let Some(p) = METER_PROVIDER.get() {
        if let Err(e) = p.shutdown() {
            tracing::warn!(error=?e, "meter provider shutdown failed");
        }
    }
}

/// Install the OpenTelemetry meter provider backed by the Prometheus registry served on
/// `/metrics`.
pub fn init_metrics() -> Result<()> {
    METER_PROVIDER.get_or_try_init(|| -> Result<SdkMeterProvider> {
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(PROM_REGISTRY.clone())
            .build()?;
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        opentelemetry::global::set_meter_provider(provider.clone());
        Ok(provider)
    })?;
    Ok(())
}

pub async fn start_health_server(port: u16) -> Result<()> {
    let app = Router::new()
        .route("/live", get(|| async { axum::Json(serde_json::json!({"live": is_live()})) }))
        .route("/ready", get(|| async { axum::Json(serde_json::json!({"ready": is_ready()})) }))
        .route(
            "/status",
            get(|| async {
                let version = CONFIG_CACHE.get().and_then(|c| c.read().cfg.config_version.clone());
                axum::Json(serde_json::json!({
                    "live": is_live(),
                    "ready": is_ready(),
                    "config_version": version,
                }))
            }),
        )
        .route("/metrics", get(metrics_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(?addr, "health server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error=?e, "health server failed");
        }
    });
    Ok(())
}

async fn metrics_handler() -> axum::response::Response {
    if METER_PROVIDER.get().is_none() {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response();
    }
    let metric_families = PROM_REGISTRY.gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response();
    }
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DynamicConfig {
    pub service_name: Option<String>,
    pub nats_url: Option<String>,
    pub log_level: Option<String>,
    pub config_version: Option<String>,
    /// Directory of the embedded record store; absent means ephemeral.
    pub data_dir: Option<String>,
    pub health_port: Option<u16>,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            service_name: None,
            nats_url: Some("127.0.0.1:4222".into()),
            log_level: Some("info".into()),
            config_version: Some("0".into()),
            data_dir: None,
            health_port: Some(9091),
        }
    }
}

/// Layered sources shared by every config type: optional YAML file (`SERVING_CONFIG_FILE`),
/// optional remote YAML (`SERVING_CONFIG_HTTP`) and `SERVING__*` environment overrides.
/// Callers add their own defaults.
pub async fn config_builder() -> Result<ConfigBuilder<DefaultState>> {
    let mut builder = config::Config::builder();
    if let Ok(file) = std::env::var("SERVING_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    if let Ok(http_url) = std::env::var("SERVING_CONFIG_HTTP") {
        match reqwest::get(http_url.clone()).await {
            Ok(resp) => match resp.text().await {
                Ok(text) => {
                    builder = builder
                        .add_source(config::File::from_str(&text, config::FileFormat::Yaml));
                }
                Err(e) => tracing::warn!(error=?e, url=%http_url, "remote config body unreadable"),
            },
            Err(e) => tracing::warn!(error=?e, url=%http_url, "remote config fetch failed"),
        }
    }
    builder = builder.add_source(
        config::Environment::with_prefix("SERVING").separator("__").try_parsing(true),
    );
    Ok(builder)
}

pub async fn load_config(service: &str) -> Result<DynamicConfig> {
    if let Some(lock) = CONFIG_CACHE.get() {
        let guard = lock.read();
        if guard.fetched_at.elapsed() < guard.ttl {
            return Ok(guard.cfg.clone());
        }
    }
    let cfg = config_builder().await?
        .set_default("service_name", service)?
        .set_default("nats_url", "127.0.0.1:4222")?
        .set_default("log_level", "info")?
        .set_default("config_version", "0")?
        .set_default("health_port", 9091)?
        .build()?;
    let dyn_cfg: DynamicConfig = cfg.try_deserialize()?;
    let ttl_secs: u64 = std::env::var("SERVING_CONFIG_TTL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);
    let file_path = std::env::var("SERVING_CONFIG_FILE").ok().map(PathBuf::from);
    let cached = CachedConfig {
        cfg: dyn_cfg.clone(),
        fetched_at: Instant::now(),
        ttl: Duration::from_secs(ttl_secs),
        file: file_path,
    };
    let mut first_load = false;
    let lock = CONFIG_CACHE.get_or_init(|| {
        first_load = true;
        RwLock::new(cached.clone())
    });
    *lock.write() = cached;
    if first_load {
        if let Some(f) = lock.read().file.clone() {
            spawn_file_watcher(f);
        }
    }
    Ok(dyn_cfg)
}

/// Last loaded configuration, if any.
pub fn current_config() -> Option<DynamicConfig> {
    CONFIG_CACHE.get().map(|c| c.read().cfg.clone())
}

pub async fn force_reload(service: &str) -> Result<DynamicConfig> {
    if let Some(lock) = CONFIG_CACHE.get() {
        lock.write().ttl = Duration::ZERO;
    }
    load_config(service).await
}

fn spawn_file_watcher(path: PathBuf) {
    tokio::spawn(async move {
        if let Err(e) = watch_loop(path).await {
            tracing::warn!(error=?e, "config watch loop exited");
        }
    });
}

async fn watch_loop(path: PathBuf) -> Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.blocking_send(res);
        },
        notify::Config::default(),
    )?;
    watcher.watch(&path, notify::RecursiveMode::NonRecursive)?;
    while let Some(evt) = rx.recv().await {
        if let Ok(ev) = evt {
            if matches!(ev.kind, EventKind::Modify(_)) {
                refresh_from_file(&path).await;
            }
        }
    }
    Ok(())
}

async fn refresh_from_file(path: &PathBuf) {
    let Some(lock) = CONFIG_CACHE.get() else { return };
    let text = match tokio::fs::read_to_string(path).await {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(error=?e, "config file unreadable");
            return;
        }
    };
    let parsed = config::Config::builder()
        .add_source(config::File::from_str(&text, config::FileFormat::Yaml))
        .build()
        .and_then(|c| c.try_deserialize::<DynamicConfig>());
    match parsed {
        Ok(new_cfg) => {
            tracing::info!(version=?new_cfg.config_version, "config reloaded from file");
            let mut w = lock.write();
            w.cfg = new_cfg;
            w.fetched_at = Instant::now();
        }
        Err(e) => tracing::warn!(error=?e, "config reload rejected"),
    }
}

pub mod resilience;
pub use resilience::{retry_async, RetryConfig, CircuitBreaker, BreakerState, ResilienceError};
mod metrics_ext;
pub use metrics_ext::{
    SERVING_METRICS, ServingMetrics, RoutingMetrics, PipelineMetrics, AggregatorMetrics,
    LifecycleMetrics, WorkerMetrics, ResilienceMetrics,
};
