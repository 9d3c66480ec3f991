//! Prometheus metrics for the hub.
//!
//! Raw collectors live in `lazy_static` statics; the rest of the crate goes
//! through the helper structs so call sites stay one line and the metric
//! names stay in one place.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "wshub";

lazy_static! {
    /// Active connections in the registry
    pub static ref CONNECTIONS_TOTAL: IntGauge = register_int_gauge!(
        format!("{}_connections_total", METRIC_PREFIX),
        "Total number of active connections in the registry"
    ).unwrap();

    /// Broadcasts dispatched, by targeting mode
    pub static ref BROADCASTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_broadcasts_total", METRIC_PREFIX),
        "Total broadcast operations dispatched",
        &["target"]
    ).unwrap();

    /// Frames successfully handed to a connection sink
    pub static ref MESSAGES_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_delivered_total", METRIC_PREFIX),
        "Total messages successfully delivered to connection sinks"
    ).unwrap();

    /// Frames a sink refused or timed out on
    pub static ref MESSAGES_FAILED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_failed_total", METRIC_PREFIX),
        "Total message delivery failures"
    ).unwrap();

    /// Ping round-trip times reported by the I/O layer
    pub static ref PING_RTT_SECONDS: Histogram = register_histogram!(
        format!("{}_ping_rtt_seconds", METRIC_PREFIX),
        "Ping round-trip time in seconds",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    ).unwrap();

    /// Pings issued by the supervisor
    pub static ref PINGS_SENT_TOTAL: IntCounter = register_int_counter!(
        format!("{}_pings_sent_total", METRIC_PREFIX),
        "Total ping frames issued by the supervisor"
    ).unwrap();

    /// Expired key/value entries removed by the periodic purge
    pub static ref KV_PURGED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_kv_purged_total", METRIC_PREFIX),
        "Total expired key/value entries purged"
    ).unwrap();
}

/// Registry-side metric updates.
pub struct RegistryMetrics;

impl RegistryMetrics {
    pub fn set_connections(count: usize) {
        CONNECTIONS_TOTAL.set(count as i64);
    }

    pub fn observe_ping_rtt(rtt: Duration) {
        PING_RTT_SECONDS.observe(rtt.as_secs_f64());
    }
}

/// Broadcaster-side metric updates.
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn record_broadcast(target: &str) {
        BROADCASTS_TOTAL.with_label_values(&[target]).inc();
    }

    pub fn record_outcome(delivered: usize, failed: usize) {
        MESSAGES_DELIVERED_TOTAL.inc_by(delivered as u64);
        MESSAGES_FAILED_TOTAL.inc_by(failed as u64);
    }
}

/// Supervisor-side metric updates.
pub struct SupervisorMetrics;

impl SupervisorMetrics {
    pub fn record_pings(count: usize) {
        PINGS_SENT_TOTAL.inc_by(count as u64);
    }

    pub fn record_kv_purge(count: usize) {
        KV_PURGED_TOTAL.inc_by(count as u64);
    }
}

/// Encode all registered metrics in the Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
