//! Prometheus metrics for the edge server

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};

// ── Ingestion ────────────────────────────────────────────────────────────────

pub static MQTT_MESSAGES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "iotedge_mqtt_messages_total",
        "MQTT publications seen by the subscriber",
        &["status"]
    )
    .unwrap()
});

pub static HTTP_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "iotedge_http_requests_total",
        "Ingestion API requests",
        &["path", "status"]
    )
    .unwrap()
});

pub static GATE_REJECTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "iotedge_gate_rejections_total",
        "Requests turned away because the permit was held",
        &["permit"]
    )
    .unwrap()
});

pub static INFLIGHT_ROUTES: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "iotedge_inflight_routes",
        "Routing tasks currently running for MQTT publications"
    )
    .unwrap()
});

// ── Buffer ───────────────────────────────────────────────────────────────────

pub static BUFFER_TAGS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("iotedge_buffer_tags", "Distinct tags currently buffered").unwrap()
});

pub static BUFFER_SAMPLES: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("iotedge_buffer_samples", "Samples currently buffered").unwrap()
});

// ── Flush ────────────────────────────────────────────────────────────────────

pub static FLUSH_CYCLES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!("iotedge_flush_cycles_total", "Completed flush cycles").unwrap()
});

pub static FLUSH_SERIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "iotedge_flush_series_total",
        "Series handled by the flush scheduler",
        &["status"]
    )
    .unwrap()
});

pub static FLUSH_RETRIES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!("iotedge_flush_retries_total", "Failed sink inserts that were retried")
        .unwrap()
});

pub static FLUSH_SAMPLES_LOST: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "iotedge_flush_samples_lost_total",
        "Samples dropped when a flush cycle ran out of time"
    )
    .unwrap()
});

pub static FLUSH_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "iotedge_flush_duration_seconds",
        "Time spent persisting one drained batch",
        vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap()
});

pub static REDIRECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "iotedge_redirect_total",
        "Batches forwarded to the redirect server",
        &["status"]
    )
    .unwrap()
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!("failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
