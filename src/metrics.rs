//! Prometheus metrics for the gateway.
//!
//! # Metrics Exposed
//!
//! - `stitch_requests_total` - Gateway calls by verb (`fetch`, `do`, `listen`)
//! - `stitch_request_duration_seconds` - Gateway call latency histogram
//! - `stitch_errors_total` - Failed gateway calls by status code
//! - `stitch_upstream_requests_total` - Downstream calls by service and method
//! - `stitch_upstream_duration_seconds` - Downstream call latency histogram
//! - `stitch_upstream_errors_total` - Downstream failures by status code
//! - `stitch_relation_batch_size` - Number of bases per relation call
//!
//! # Example
//!
//! ```rust,no_run
//! use grpc_stitch_gateway::GatewayMetrics;
//!
//! let metrics = GatewayMetrics::global();
//! println!("Total requests: {}", metrics.requests_total());
//! ```

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};
use std::time::Instant;

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

const BATCH_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0];

const VERBS: &[&str] = &["fetch", "do", "listen"];

/// Global metrics registry for the gateway
static METRICS: Lazy<GatewayMetrics> = Lazy::new(GatewayMetrics::new);

/// Gateway metrics for Prometheus monitoring.
#[derive(Clone)]
pub struct GatewayMetrics {
    /// Gateway calls by verb
    pub requests: IntCounterVec,
    /// Gateway call duration in seconds
    pub duration: HistogramVec,
    /// Failed gateway calls by verb and code
    pub errors: IntCounterVec,
    /// Downstream calls by service and method
    pub upstream_requests: IntCounterVec,
    /// Downstream call duration in seconds
    pub upstream_duration: HistogramVec,
    /// Downstream failures by service, method and code
    pub upstream_errors: IntCounterVec,
    /// Bases sent per relation call
    pub batch_size: HistogramVec,
}

impl GatewayMetrics {
    /// Create a new metrics instance with registered Prometheus metrics
    pub fn new() -> Self {
        Self {
            requests: register_int_counter_vec!(
                "stitch_requests_total",
                "Total number of gateway requests",
                &["verb"]
            )
            .expect("metric can be created"),

            duration: register_histogram_vec!(
                "stitch_request_duration_seconds",
                "Gateway request duration in seconds",
                &["verb"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("metric can be created"),

            errors: register_int_counter_vec!(
                "stitch_errors_total",
                "Total number of failed gateway requests",
                &["verb", "code"]
            )
            .expect("metric can be created"),

            upstream_requests: register_int_counter_vec!(
                "stitch_upstream_requests_total",
                "Total number of downstream gRPC calls",
                &["service", "method"]
            )
            .expect("metric can be created"),

            upstream_duration: register_histogram_vec!(
                "stitch_upstream_duration_seconds",
                "Downstream gRPC call duration in seconds",
                &["service", "method"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("metric can be created"),

            upstream_errors: register_int_counter_vec!(
                "stitch_upstream_errors_total",
                "Total number of downstream gRPC errors",
                &["service", "method", "code"]
            )
            .expect("metric can be created"),

            batch_size: register_histogram_vec!(
                "stitch_relation_batch_size",
                "Number of bases resolved per relation call",
                &["relation"],
                BATCH_BUCKETS.to_vec()
            )
            .expect("metric can be created"),
        }
    }

    /// Get the global metrics instance
    pub fn global() -> &'static Self {
        &METRICS
    }

    /// Record a gateway request
    pub fn record_request(&self, verb: &str) {
        self.requests.with_label_values(&[verb]).inc();
    }

    /// Record gateway request duration
    pub fn record_duration(&self, verb: &str, duration_secs: f64) {
        self.duration.with_label_values(&[verb]).observe(duration_secs);
    }

    /// Record a failed gateway request
    pub fn record_error(&self, verb: &str, code: &str) {
        self.errors.with_label_values(&[verb, code]).inc();
    }

    /// Record a downstream call
    pub fn record_upstream_request(&self, service: &str, method: &str) {
        self.upstream_requests
            .with_label_values(&[service, method])
            .inc();
    }

    /// Record downstream call duration
    pub fn record_upstream_duration(&self, service: &str, method: &str, duration_secs: f64) {
        self.upstream_duration
            .with_label_values(&[service, method])
            .observe(duration_secs);
    }

    /// Record a downstream error
    pub fn record_upstream_error(&self, service: &str, method: &str, code: &str) {
        self.upstream_errors
            .with_label_values(&[service, method, code])
            .inc();
    }

    /// Record how many bases one relation call carried
    pub fn record_batch_size(&self, relation: &str, size: usize) {
        self.batch_size
            .with_label_values(&[relation])
            .observe(size as f64);
    }

    /// Get total request count (for health checks / debugging)
    pub fn requests_total(&self) -> u64 {
        VERBS
            .iter()
            .map(|verb| self.requests.with_label_values(&[verb]).get())
            .sum()
    }

    /// Render all metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", err);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A timer that records the gateway call duration when dropped
pub struct RequestTimer {
    start: Instant,
    verb: &'static str,
    metrics: &'static GatewayMetrics,
}

impl RequestTimer {
    /// Start a new request timer for the given verb
    pub fn new(verb: &'static str) -> Self {
        let metrics = GatewayMetrics::global();
        metrics.record_request(verb);
        Self {
            start: Instant::now(),
            verb,
            metrics,
        }
    }

    /// Record an error for this request
    pub fn record_error(&self, code: &str) {
        self.metrics.record_error(self.verb, code);
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metrics.record_duration(self.verb, duration);
    }
}

/// Timer for downstream gRPC calls
pub struct UpstreamTimer {
    start: Instant,
    service: String,
    method: String,
    metrics: &'static GatewayMetrics,
}

impl UpstreamTimer {
    /// Start a new downstream call timer
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        let service = service.into();
        let method = method.into();
        let metrics = GatewayMetrics::global();
        metrics.record_upstream_request(&service, &method);
        Self {
            start: Instant::now(),
            service,
            method,
            metrics,
        }
    }

    /// Record an error for this call
    pub fn record_error(&self, code: &str) {
        self.metrics
            .record_upstream_error(&self.service, &self.method, code);
    }
}

impl Drop for UpstreamTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metrics
            .record_upstream_duration(&self.service, &self.method, duration);
    }
}
