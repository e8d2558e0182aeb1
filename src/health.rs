//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 when ready to serve admissions)
//! - `/metrics` - Prometheus metrics endpoint
//!
//! Served on a plaintext port separate from the TLS webhook endpoints.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

/// Labels for verification metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct VerdictLabels {
    pub verdict: String,
}

impl EncodeLabelSet for VerdictLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("verdict", self.verdict.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for admission metrics (handler + outcome)
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct AdmissionLabels {
    pub handler: String,
    pub allowed: String,
}

impl EncodeLabelSet for AdmissionLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("handler", self.handler.as_str()).encode(encoder.encode_label())?;
        ("allowed", self.allowed.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the webhook
pub struct Metrics {
    /// Cache reads served without registry I/O
    pub cache_hits: Counter,
    /// Cache reads that triggered a resolution
    pub cache_misses: Counter,
    /// End-to-end duration of one image resolution
    pub resolution_duration_seconds: Histogram,
    /// Verification outcomes by verdict
    pub verifications_total: Family<VerdictLabels, Counter>,
    /// Admission requests by handler and outcome
    pub admission_requests_total: Family<AdmissionLabels, Counter>,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let cache_hits = Counter::default();
        registry.register(
            "lakom_cache_hits",
            "Total number of cache reads served without registry I/O",
            cache_hits.clone(),
        );

        let cache_misses = Counter::default();
        registry.register(
            "lakom_cache_misses",
            "Total number of cache reads that triggered a resolution",
            cache_misses.clone(),
        );

        let resolution_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 15));
        registry.register(
            "lakom_resolution_duration_seconds",
            "Duration of image resolution in seconds",
            resolution_duration_seconds.clone(),
        );

        let verifications_total = Family::<VerdictLabels, Counter>::default();
        registry.register(
            "lakom_verifications",
            "Total number of signature verifications by verdict",
            verifications_total.clone(),
        );

        let admission_requests_total = Family::<AdmissionLabels, Counter>::default();
        registry.register(
            "lakom_admission_requests",
            "Total number of admission requests by handler and outcome",
            admission_requests_total.clone(),
        );

        Self {
            cache_hits,
            cache_misses,
            resolution_duration_seconds,
            verifications_total,
            admission_requests_total,
            registry,
        }
    }

    /// Record a cache read served without I/O
    pub fn record_cache_hit(&self) {
        self.cache_hits.inc();
    }

    /// Record a cache read that resolved against the registry
    pub fn record_cache_miss(&self) {
        self.cache_misses.inc();
    }

    /// Record one resolution's duration
    pub fn observe_resolution(&self, duration_secs: f64) {
        self.resolution_duration_seconds.observe(duration_secs);
    }

    /// Record a verification outcome
    pub fn record_verification(&self, verdict: &str) {
        self.verifications_total
            .get_or_create(&VerdictLabels {
                verdict: verdict.to_string(),
            })
            .inc();
    }

    /// Record an admission decision
    pub fn record_admission(&self, handler: &str, allowed: bool) {
        self.admission_requests_total
            .get_or_create(&AdmissionLabels {
                handler: handler.to_string(),
                allowed: allowed.to_string(),
            })
            .inc();
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the webhook is ready (keys loaded, servers started)
    ready: RwLock<bool>,
    /// Metrics registry, shared with the cache and handlers
    pub metrics: Arc<Metrics>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Mark the webhook as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the webhook is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server on the given plaintext port.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
