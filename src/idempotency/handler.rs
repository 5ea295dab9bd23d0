use crate::config::IdempotencySettings;
use crate::error::{AppError, Result};
use crate::idempotency::fingerprint::{fingerprint, Fingerprint};
use crate::idempotency::storage::{IdempotencyRecord, RecordStore};
use crate::observability::{get_metrics, mask_sensitive};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Metrics for idempotency handling.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub new_requests: AtomicU64,
    pub replayed_requests: AtomicU64,
    pub in_flight_requests: AtomicU64,
    pub mismatched_requests: AtomicU64,
    pub completed_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new(&self) {
        self.new_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed(&self) {
        self.replayed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_in_flight(&self) {
        self.in_flight_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mismatch(&self) {
        self.mismatched_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            new_requests: self.new_requests.load(Ordering::Relaxed),
            replayed_requests: self.replayed_requests.load(Ordering::Relaxed),
            in_flight_requests: self.in_flight_requests.load(Ordering::Relaxed),
            mismatched_requests: self.mismatched_requests.load(Ordering::Relaxed),
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub new_requests: u64,
    pub replayed_requests: u64,
    pub in_flight_requests: u64,
    pub mismatched_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
}

impl MetricsSnapshot {
    /// Share of requests that did not run the wrapped operation.
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            let duplicates = self.replayed_requests + self.in_flight_requests + self.mismatched_requests;
            duplicates as f64 / self.total_requests as f64
        }
    }
}

/// Configuration for the idempotency handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyHandlerConfig {
    /// How long a started record blocks other callers before it counts as abandoned.
    pub lock_ttl: Duration,
    /// How long a successful outcome stays replayable.
    pub retention_ttl: Duration,
}

impl Default for IdempotencyHandlerConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(60),
            retention_ttl: Duration::from_secs(86400), // 24 hours
        }
    }
}

impl IdempotencyHandlerConfig {
    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn with_retention_ttl(mut self, retention_ttl: Duration) -> Self {
        self.retention_ttl = retention_ttl;
        self
    }
}

impl From<&IdempotencySettings> for IdempotencyHandlerConfig {
    fn from(settings: &IdempotencySettings) -> Self {
        Self {
            lock_ttl: Duration::from_secs(settings.lock_ttl_seconds),
            retention_ttl: Duration::from_secs(settings.retention_ttl_seconds),
        }
    }
}

/// Runs operations at most once per idempotency key.
///
/// The handler itself is stateless apart from counters; every piece of shared
/// state lives in the record store, so clones of a handler (or handlers in
/// other processes using the same Redis) coordinate through it.
pub struct IdempotencyHandler<S> {
    store: Arc<S>,
    metrics: Arc<IdempotencyMetrics>,
    config: IdempotencyHandlerConfig,
}

impl<S> Clone for IdempotencyHandler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            metrics: Arc::clone(&self.metrics),
            config: self.config.clone(),
        }
    }
}

impl<S: RecordStore> IdempotencyHandler<S> {
    pub fn new(store: S, config: IdempotencyHandlerConfig) -> Self {
        Self::with_shared_store(Arc::new(store), config)
    }

    pub fn with_shared_store(store: Arc<S>, config: IdempotencyHandlerConfig) -> Self {
        Self {
            store,
            metrics: Arc::new(IdempotencyMetrics::new()),
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &IdempotencyHandlerConfig {
        &self.config
    }

    /// Gets the metrics for this handler.
    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Executes `operation` under `idempotency_key`.
    ///
    /// The caller that acquires the lock runs the operation and caches its
    /// response. Every other caller gets the cached response,
    /// [`AppError::RequestInFlight`] while the first run is still going, or
    /// [`AppError::RequestMismatch`] when the key was used with another payload.
    /// A failed operation releases the lock so the key can be retried at once.
    #[tracing::instrument(
        name = "idempotent_run",
        skip_all,
        fields(key = %mask_sensitive(idempotency_key, 4))
    )]
    pub async fn run<Req, Resp, F, Fut>(&self, idempotency_key: &str, request: Req, operation: F) -> Result<Resp>
    where
        Req: Serialize,
        Resp: Serialize + DeserializeOwned,
        F: FnOnce(Req) -> Fut,
        Fut: Future<Output = Result<Resp>>,
    {
        self.metrics.record_request();
        let request_hash = fingerprint(&request)?;

        let acquired = self
            .store
            .acquire_lock(idempotency_key, &request_hash, self.config.lock_ttl)
            .await?;

        if !acquired {
            return self.replay(idempotency_key, &request_hash).await;
        }

        self.metrics.record_new();
        tracing::debug!("idempotency lock acquired");

        match operation(request).await {
            Ok(response) => {
                let record = IdempotencyRecord::success(request_hash, serde_json::to_value(&response)?);
                self.store
                    .save(idempotency_key, &record, self.config.retention_ttl)
                    .await?;
                self.metrics.record_completed();
                get_metrics().record_idempotent_outcome("completed");
                Ok(response)
            }
            Err(err) => {
                self.metrics.record_failed();
                get_metrics().record_idempotent_outcome("failed");
                tracing::debug!(error = %err, "operation failed, releasing idempotency lock");

                match self.store.release_lock(idempotency_key).await {
                    Ok(()) => Err(err),
                    Err(release) => Err(AppError::ReleaseFailed {
                        handler: Box::new(err),
                        release: Box::new(release),
                    }),
                }
            }
        }
    }

    async fn replay<Resp>(&self, idempotency_key: &str, request_hash: &Fingerprint) -> Result<Resp>
    where
        Resp: DeserializeOwned,
    {
        let record = self
            .store
            .load(idempotency_key)
            .await?
            .ok_or_else(|| AppError::RecordExpired(idempotency_key.to_string()))?;

        if &record.request != request_hash {
            self.metrics.record_mismatch();
            get_metrics().record_idempotent_outcome("mismatch");
            return Err(AppError::RequestMismatch);
        }

        if record.is_started() {
            self.metrics.record_in_flight();
            get_metrics().record_idempotent_outcome("in_flight");
            return Err(AppError::RequestInFlight);
        }

        self.metrics.record_replayed();
        get_metrics().record_idempotent_outcome("replayed");
        tracing::debug!("replaying cached response");

        let response = record.response.unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(response)?)
    }
}
