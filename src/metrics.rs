//! Operational metrics for the loader
//!
//! Recording goes through the `metrics` facade, so every helper here is a
//! cheap no-op until [`init_metrics`] installs the Prometheus exporter.
//!
//! ## Exported series
//!
//! - `provider_requests_total{category,outcome}` and `provider_request_duration_seconds{category}`
//! - `pacing_wait_seconds{category}`
//! - `load_retries_total{kind}` and `retry_backoff_duration_seconds{kind}`
//! - `segments_fetched_total`, `segments_skipped_total{kind}`, `rows_merged_total`
//! - `connection_pool_healthy`, `connection_pool_stale`, `connection_identity_rotations_total`
//! - `loads_completed_total{mode}`, `loads_failed_total{phase}`

use crate::classifier::ErrorKind;
use crate::pacing::RequestCategory;
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

static METRICS_ADDR: OnceCell<SocketAddr> = OnceCell::new();

/// Install the Prometheus exporter listening on `addr`.
///
/// Idempotent: later calls are ignored and report the address already bound.
pub fn init_metrics(addr: SocketAddr) -> Result<SocketAddr, String> {
    let bound = METRICS_ADDR.get_or_try_init(|| {
        info!(%addr, "Initializing metrics exporter");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;
        describe_all();
        Ok::<_, String>(addr)
    })?;
    if *bound != addr {
        debug!(requested = %addr, bound = %bound, "Metrics already initialized, skipping");
    }
    Ok(*bound)
}

/// Whether the exporter has been installed
pub fn is_initialized() -> bool {
    METRICS_ADDR.get().is_some()
}

fn describe_all() {
    describe_counter!(
        "provider_requests_total",
        Unit::Count,
        "Provider calls by request category and outcome"
    );
    describe_histogram!(
        "provider_request_duration_seconds",
        Unit::Seconds,
        "Provider round-trip time"
    );
    describe_histogram!(
        "pacing_wait_seconds",
        Unit::Seconds,
        "Time spent waiting for the pacing governor"
    );
    describe_counter!(
        "load_retries_total",
        Unit::Count,
        "Segment retries by error kind"
    );
    describe_histogram!(
        "retry_backoff_duration_seconds",
        Unit::Seconds,
        "Backoff slept before a retry"
    );
    describe_counter!(
        "segments_fetched_total",
        Unit::Count,
        "Segments fetched and merged"
    );
    describe_counter!(
        "segments_skipped_total",
        Unit::Count,
        "Segments skipped by error kind"
    );
    describe_counter!("rows_merged_total", Unit::Count, "Rows written to the cache");
    describe_gauge!(
        "connection_pool_healthy",
        Unit::Count,
        "Healthy pooled connections"
    );
    describe_gauge!(
        "connection_pool_stale",
        Unit::Count,
        "Pooled connections that are no longer healthy"
    );
    describe_counter!(
        "connection_identity_rotations_total",
        Unit::Count,
        "Handshakes retried with a new identity after a conflict"
    );
    describe_counter!("loads_completed_total", Unit::Count, "Loads that finished");
    describe_counter!(
        "loads_failed_total",
        Unit::Count,
        "Loads that failed, by phase"
    );
}

/// Timer for one provider call
pub struct ProviderCallMetrics {
    category: RequestCategory,
    started: Instant,
}

impl ProviderCallMetrics {
    /// Start timing a call
    pub fn start(category: RequestCategory) -> Self {
        Self {
            category,
            started: Instant::now(),
        }
    }

    /// Record the call's outcome (`ok`, `timeout` or an error kind label)
    pub fn finish(self, outcome: &'static str) {
        let elapsed = self.started.elapsed();
        counter!(
            "provider_requests_total",
            "category" => self.category.as_str(),
            "outcome" => outcome,
        )
        .increment(1);
        histogram!(
            "provider_request_duration_seconds",
            "category" => self.category.as_str(),
        )
        .record(elapsed.as_secs_f64());
    }
}

/// Record time spent in the pacing governor
pub fn record_pacing_wait(category: RequestCategory, waited: Duration) {
    histogram!("pacing_wait_seconds", "category" => category.as_str())
        .record(waited.as_secs_f64());
}

/// Record a retry and the backoff slept before it
pub fn record_retry(kind: ErrorKind, backoff: Duration) {
    counter!("load_retries_total", "kind" => kind.as_str()).increment(1);
    histogram!("retry_backoff_duration_seconds", "kind" => kind.as_str())
        .record(backoff.as_secs_f64());
}

/// Record a segment that was fetched and merged
pub fn record_segment_fetched(rows_merged: usize) {
    counter!("segments_fetched_total").increment(1);
    counter!("rows_merged_total").increment(rows_merged as u64);
}

/// Record a skipped segment
pub fn record_segment_skipped(kind: ErrorKind) {
    counter!("segments_skipped_total", "kind" => kind.as_str()).increment(1);
}

/// Publish pool health counts
pub fn record_pool_status(healthy: usize, stale: usize) {
    gauge!("connection_pool_healthy").set(healthy as f64);
    gauge!("connection_pool_stale").set(stale as f64);
}

/// Record a handshake retried under a new identity
pub fn record_identity_rotation() {
    counter!("connection_identity_rotations_total").increment(1);
}

/// Record a finished load
pub fn record_load_completed(mode: &'static str) {
    counter!("loads_completed_total", "mode" => mode).increment(1);
}

/// Record a failed load
pub fn record_load_failed(phase: &'static str) {
    counter!("loads_failed_total", "phase" => phase).increment(1);
}
