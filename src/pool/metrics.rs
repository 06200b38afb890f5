//! Prometheus metrics for buffer pools
//!
//! Counters are process-wide and shared by every pool. Call [`init_metrics`]
//! once to register them, then scrape with [`export_metrics`].

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    pub static ref BUFFERS_ISSUED: IntCounter = IntCounter::new(
        "slabbuf_buffers_issued_total",
        "Buffers handed out by get_buffer"
    ).unwrap();

    pub static ref BUFFERS_RELEASED: IntCounter = IntCounter::new(
        "slabbuf_buffers_released_total",
        "Buffers disposed and returned to their slabs"
    ).unwrap();

    pub static ref BYTES_ISSUED: IntCounter = IntCounter::new(
        "slabbuf_bytes_issued_total",
        "Bytes handed out by get_buffer"
    ).unwrap();

    pub static ref SLABS_CREATED: IntCounter = IntCounter::new(
        "slabbuf_slabs_created_total",
        "Slabs allocated by all pools"
    ).unwrap();

    pub static ref SLABS_EVICTED: IntCounter = IntCounter::new(
        "slabbuf_slabs_evicted_total",
        "Empty slabs evicted by all pools"
    ).unwrap();

    pub static ref GROWTH_ROLLBACKS: IntCounter = IntCounter::new(
        "slabbuf_growth_rollbacks_total",
        "Requests whose partial allocation was rolled back after a growth failure"
    ).unwrap();

    pub static ref LIVE_SLABS: IntGauge = IntGauge::new(
        "slabbuf_live_slabs",
        "Slabs currently held by all pools"
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    info!("Initializing buffer pool metrics");

    METRICS_REGISTRY.register(Box::new(BUFFERS_ISSUED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(BUFFERS_RELEASED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(BYTES_ISSUED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(SLABS_CREATED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(SLABS_EVICTED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(GROWTH_ROLLBACKS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(LIVE_SLABS.clone())).ok();
}

pub(crate) fn record_buffer_issued(size: u64) {
    BUFFERS_ISSUED.inc();
    BYTES_ISSUED.inc_by(size);
}

pub(crate) fn record_buffer_released() {
    BUFFERS_RELEASED.inc();
}

pub(crate) fn record_slabs_created(count: usize) {
    SLABS_CREATED.inc_by(count as u64);
    LIVE_SLABS.add(count as i64);
}

pub(crate) fn record_slab_evicted() {
    SLABS_EVICTED.inc();
    LIVE_SLABS.dec();
}

pub(crate) fn record_slabs_dropped(count: usize) {
    LIVE_SLABS.sub(count as i64);
}

pub(crate) fn record_growth_rollback() {
    GROWTH_ROLLBACKS.inc();
}

/// Export all metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics\n"))
}
