// Proxy Metrics Module
// Prometheus counters for request outcomes, cache effectiveness and tunnels

use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static::lazy_static! {
    // Request counters
    pub static ref REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "stashproxy_requests_total",
        "Total number of proxied requests by method and outcome",
        &["method", "outcome"]
    ).unwrap();

    pub static ref BLOCKED_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "stashproxy_blocked_requests_total",
        "Total number of requests rejected by the blocklist",
        &["kind"]
    ).unwrap();

    // Cache metrics
    pub static ref CACHE_LOOKUPS: IntCounterVec = register_int_counter_vec!(
        "stashproxy_cache_lookups_total",
        "Total number of cache lookups",
        &["cache_status"]
    ).unwrap();

    pub static ref CACHE_WRITES: IntCounterVec = register_int_counter_vec!(
        "stashproxy_cache_writes_total",
        "Total number of cache artifact writes",
        &["result"]
    ).unwrap();

    // Origin fetch metrics
    pub static ref ORIGIN_FETCHES: IntCounterVec = register_int_counter_vec!(
        "stashproxy_origin_fetches_total",
        "Total number of origin fetches by content kind and result",
        &["kind", "result"]
    ).unwrap();

    pub static ref ORIGIN_FETCH_DURATION: HistogramVec = register_histogram_vec!(
        "stashproxy_origin_fetch_duration_seconds",
        "Origin fetch duration from request to last byte",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
    ).unwrap();

    // Tunnel metrics
    pub static ref TUNNELS_OPENED: IntCounterVec = register_int_counter_vec!(
        "stashproxy_tunnels_total",
        "Total number of CONNECT tunnel attempts by result",
        &["result"]
    ).unwrap();

    pub static ref TUNNELS_ACTIVE: IntGauge = register_int_gauge!(
        "stashproxy_tunnels_active",
        "Number of tunnels currently relaying"
    ).unwrap();

    pub static ref TUNNEL_BYTES: IntCounterVec = register_int_counter_vec!(
        "stashproxy_tunnel_bytes_total",
        "Bytes relayed through tunnels by direction",
        &["direction"]
    ).unwrap();
}

/// Helper struct for recording proxy metrics
pub struct ProxyMetrics;

impl ProxyMetrics {
    /// Record a finished request
    pub fn record_request(method: &str, outcome: &str) {
        REQUESTS_TOTAL.with_label_values(&[method, outcome]).inc();
    }

    /// Record a blocklist rejection
    pub fn record_blocked(is_connect: bool) {
        BLOCKED_REQUESTS
            .with_label_values(&[if is_connect { "connect" } else { "http" }])
            .inc();
    }

    /// Record cache hit/miss
    pub fn record_cache_lookup(is_hit: bool) {
        CACHE_LOOKUPS
            .with_label_values(&[if is_hit { "hit" } else { "miss" }])
            .inc();
    }

    /// Record the outcome of writing a cache artifact
    pub fn record_cache_write(success: bool) {
        CACHE_WRITES
            .with_label_values(&[if success { "success" } else { "failure" }])
            .inc();
    }

    /// Record an origin fetch
    pub fn record_origin_fetch(kind: &str, result: &str, duration_secs: f64) {
        ORIGIN_FETCHES.with_label_values(&[kind, result]).inc();
        ORIGIN_FETCH_DURATION
            .with_label_values(&[kind])
            .observe(duration_secs);
    }

    /// Record a tunnel attempt result (established, timeout, failed)
    pub fn record_tunnel(result: &str) {
        TUNNELS_OPENED.with_label_values(&[result]).inc();
    }

    pub fn tunnel_started() {
        TUNNELS_ACTIVE.inc();
    }

    pub fn tunnel_finished(client_to_origin: u64, origin_to_client: u64) {
        TUNNELS_ACTIVE.dec();
        TUNNEL_BYTES
            .with_label_values(&["client_to_origin"])
            .inc_by(client_to_origin);
        TUNNEL_BYTES
            .with_label_values(&["origin_to_client"])
            .inc_by(origin_to_client);
    }

    /// Render every registered metric in the Prometheus text format
    pub fn render() -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
