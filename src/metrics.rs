//! Lightweight metrics helpers for Viaduct.
//!
//! This module exposes a small set of convenience functions and RAII timers
//! wrapping the `metrics` crate macros. It intentionally avoids embedding a
//! concrete exporter (the application can initialize any compatible recorder
//! externally) while still documenting and describing Viaduct-specific metric
//! names.
//!
//! Provided metrics (labels vary by family):
//! * `viaduct_exchanges_total` (counter)
//! * `viaduct_exchange_duration_seconds` (histogram)
//! * `viaduct_synthesized_responses_total` (counter)
//! * `viaduct_relayed_bytes_total` (counter, per direction)
//! * `viaduct_pool_reuse_total` (counter, per origin)
//! * `viaduct_active_pairings` (gauge)
//! * `viaduct_busy_origins` (gauge)
//!
//! The timer struct leverages `Drop` to record durations safely even when
//! early returns or errors occur.
use std::time::Instant;

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

// Viaduct-specific metric names
pub const VIADUCT_EXCHANGES_TOTAL: &str = "viaduct_exchanges_total";
pub const VIADUCT_EXCHANGE_DURATION_SECONDS: &str = "viaduct_exchange_duration_seconds";
pub const VIADUCT_SYNTHESIZED_RESPONSES_TOTAL: &str = "viaduct_synthesized_responses_total";
pub const VIADUCT_RELAYED_BYTES_TOTAL: &str = "viaduct_relayed_bytes_total"; // labels: direction
pub const VIADUCT_POOL_REUSE_TOTAL: &str = "viaduct_pool_reuse_total"; // labels: origin
pub const VIADUCT_ACTIVE_PAIRINGS: &str = "viaduct_active_pairings";
pub const VIADUCT_BUSY_ORIGINS: &str = "viaduct_busy_origins";

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        VIADUCT_EXCHANGES_TOTAL,
        Unit::Count,
        "Total number of relayed request/response exchanges."
    );
    describe_histogram!(
        VIADUCT_EXCHANGE_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of relayed exchanges, dispatch to response completion."
    );
    describe_counter!(
        VIADUCT_SYNTHESIZED_RESPONSES_TOTAL,
        Unit::Count,
        "Responses answered by the relay itself, by status code."
    );
    describe_counter!(
        VIADUCT_RELAYED_BYTES_TOTAL,
        Unit::Bytes,
        "Body bytes relayed between peers (by direction)."
    );
    describe_counter!(
        VIADUCT_POOL_REUSE_TOTAL,
        Unit::Count,
        "Idle origin connections reused from the keep-alive pool."
    );
    describe_gauge!(
        VIADUCT_ACTIVE_PAIRINGS,
        "Number of currently open client pairings."
    );
    describe_gauge!(
        VIADUCT_BUSY_ORIGINS,
        "Origin connections currently serving a dispatched request."
    );
});

/// Count one completed relayed exchange.
pub fn increment_exchange_total(method: &str, status: u16) {
    counter!(
        VIADUCT_EXCHANGES_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Count one response the relay synthesized without a backend.
pub fn increment_synthesized(status: u16) {
    counter!(
        VIADUCT_SYNTHESIZED_RESPONSES_TOTAL,
        "status" => status.to_string()
    )
    .increment(1);
}

/// Add relayed body bytes for one direction ("upstream" or "downstream").
pub fn add_relayed_bytes(direction: &str, bytes: u64) {
    counter!(VIADUCT_RELAYED_BYTES_TOTAL, "direction" => direction.to_string()).increment(bytes);
}

/// Count one pooled-connection reuse hit.
pub fn increment_pool_reuse(origin: &str) {
    counter!(VIADUCT_POOL_REUSE_TOTAL, "origin" => origin.to_string()).increment(1);
}

/// Set the current open pairing count.
pub fn set_active_pairings(count: usize) {
    gauge!(VIADUCT_ACTIVE_PAIRINGS).set(count as f64);
}

/// Set the current busy origin-connection count.
pub fn set_busy_origins(count: u64) {
    gauge!(VIADUCT_BUSY_ORIGINS).set(count as f64);
}

/// Record a completed exchange's duration.
pub fn record_exchange_duration(method: &str, duration: std::time::Duration) {
    histogram!(
        VIADUCT_EXCHANGE_DURATION_SECONDS,
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// RAII helper measuring one exchange's duration.
pub struct ExchangeTimer {
    start: Instant,
    method: String,
}

impl ExchangeTimer {
    pub fn new(method: &str) -> Self {
        Self {
            start: Instant::now(),
            method: method.to_string(),
        }
    }
}

impl Drop for ExchangeTimer {
    fn drop(&mut self) {
        record_exchange_duration(&self.method, self.start.elapsed());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing Viaduct metrics system");

    // Force lazy initialization of metric descriptions
    Lazy::force(&DESCRIPTIONS);

    tracing::info!("Viaduct metrics system initialized successfully");
    Ok(())
}
