use crate::error::{AppError, Result};
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Process-wide metrics for the idempotency layer.
///
/// Calls are no-ops until a recorder is installed with [`init_metrics`].
#[derive(Debug, Clone, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    /// Records how an idempotent execution ended (`completed`, `failed`,
    /// `replayed`, `in_flight`, `mismatch`).
    pub fn record_idempotent_outcome(&self, outcome: &'static str) {
        counter!("idempotency_requests_total", "outcome" => outcome).increment(1);
    }

    pub fn record_store_operation(&self, backend: &'static str, operation: &str, duration_ms: f64, success: bool) {
        counter!(
            "idempotency_store_operations_total",
            "backend" => backend,
            "operation" => operation.to_string(),
            "success" => success.to_string()
        )
        .increment(1);
        histogram!(
            "idempotency_store_operation_duration_ms",
            "backend" => backend,
            "operation" => operation.to_string()
        )
        .record(duration_ms);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder once and returns its handle.
///
/// Safe to call from several threads; later calls return the first handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let _guard = INSTALL_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to install Prometheus recorder: {}", e)))?;
    describe_metrics();

    METRICS.get_or_init(Metrics::new);
    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

fn describe_metrics() {
    describe_counter!(
        "idempotency_requests_total",
        Unit::Count,
        "Idempotent executions by outcome"
    );
    describe_counter!(
        "idempotency_store_operations_total",
        Unit::Count,
        "Record store operations by backend and operation"
    );
    describe_histogram!(
        "idempotency_store_operation_duration_ms",
        Unit::Milliseconds,
        "Record store operation latency in milliseconds"
    );
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
