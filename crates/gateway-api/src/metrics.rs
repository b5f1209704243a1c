//! Prometheus metrics for the gateway
//!
//! This module is only compiled when the `metrics` feature is enabled.
//!
//! - `gateway_requests_total{status}` - HTTP responses by status code
//! - `gateway_cache_lookups_total{result}` - cache hits, shared results and misses
//! - `gateway_rate_limit_rejections_total` - requests denied by the rate limiter
//! - `gateway_circuit_breaker_state` - 0=closed, 1=open, 2=half-open
//! - `gateway_warehouse_calls_total{outcome}` - warehouse calls by outcome
//! - `gateway_warehouse_call_duration_seconds` - warehouse call latency

use axum::{extract::Request, http::StatusCode, middleware::Next, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_int_counter, register_int_gauge,
    CounterVec, Encoder, Histogram, IntCounter, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "gateway_requests_total",
        "Total number of HTTP responses by status",
        &["status"]
    )
    .unwrap();

    pub static ref CACHE_LOOKUPS_TOTAL: CounterVec = register_counter_vec!(
        "gateway_cache_lookups_total",
        "Cache lookups by result",
        &["result"]
    )
    .unwrap();

    pub static ref RATE_LIMIT_REJECTIONS: IntCounter = register_int_counter!(
        "gateway_rate_limit_rejections_total",
        "Requests denied by the rate limiter"
    )
    .unwrap();

    /// 0=closed, 1=open, 2=half-open
    pub static ref CIRCUIT_BREAKER_STATE: IntGauge = register_int_gauge!(
        "gateway_circuit_breaker_state",
        "Warehouse circuit breaker state"
    )
    .unwrap();

    pub static ref WAREHOUSE_CALLS_TOTAL: CounterVec = register_counter_vec!(
        "gateway_warehouse_calls_total",
        "Warehouse calls by outcome",
        &["outcome"]
    )
    .unwrap();

    pub static ref WAREHOUSE_CALL_DURATION_SECONDS: Histogram = register_histogram!(
        "gateway_warehouse_call_duration_seconds",
        "Warehouse call latency in seconds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();
}

/// Middleware counting responses by status.
pub async fn track_metrics(req: Request, next: Next) -> impl IntoResponse {
    let response = next.run(req).await;
    let status = response.status().as_u16().to_string();
    REQUESTS_TOTAL.with_label_values(&[&status]).inc();
    response
}

/// Handler for the `/metrics` endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", encoder.format_type())],
            buffer,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUPS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_warehouse_call(outcome: &str, duration_secs: f64) {
    WAREHOUSE_CALLS_TOTAL.with_label_values(&[outcome]).inc();
    WAREHOUSE_CALL_DURATION_SECONDS.observe(duration_secs);
}
