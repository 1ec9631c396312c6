// src/metrics.rs

//! Prometheus counters for the key pool. Every recorder is a no-op when the
//! `metrics` feature is off, so call sites never need their own `cfg`.

use crate::config::Algorithm;
use crate::storage::PoolStats;

#[cfg(feature = "metrics")]
use ::metrics::{counter, gauge};
#[cfg(feature = "metrics")]
pub use metrics_exporter_prometheus::PrometheusHandle;

/// Installs the global Prometheus recorder.
#[cfg(feature = "metrics")]
pub fn initialize_metrics() -> crate::error::Result<PrometheusHandle> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| crate::error::AppError::Internal(format!("failed to install Prometheus recorder: {e}")))
}

pub fn record_selection(algorithm: Algorithm) {
    #[cfg(feature = "metrics")]
    counter!("keypool_selections_total", "algorithm" => algorithm.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = algorithm;
}

pub fn record_ban() {
    #[cfg(feature = "metrics")]
    counter!("keypool_bans_total").increment(1);
}

pub fn record_disable(cause: &'static str) {
    #[cfg(feature = "metrics")]
    counter!("keypool_disables_total", "cause" => cause).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = cause;
}

pub fn record_probe(result: &'static str) {
    #[cfg(feature = "metrics")]
    counter!("keypool_probe_results_total", "result" => result).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = result;
}

pub fn record_upstream_status(status: u16) {
    #[cfg(feature = "metrics")]
    counter!("keypool_upstream_responses_total", "status" => status.to_string()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = status;
}

/// Sets the keys-by-status gauge.
pub fn record_pool_stats(stats: &PoolStats) {
    #[cfg(feature = "metrics")]
    {
        gauge!("keypool_keys", "status" => "active").set(stats.active as f64);
        gauge!("keypool_keys", "status" => "disabled").set(stats.disabled as f64);
        gauge!("keypool_keys", "status" => "banned").set(stats.banned as f64);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = stats;
}
