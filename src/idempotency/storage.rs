use crate::error::{AppError, Result};
use crate::idempotency::fingerprint::Fingerprint;
use crate::observability::{get_metrics, LatencyTimer};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Status of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    /// Lock held; the operation is running or its holder crashed.
    Started,
    /// Operation completed and its response is cached.
    Success,
}

/// Stored idempotency record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub status: IdempotencyStatus,
    /// Fingerprint of the request that created the record.
    pub request: Fingerprint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
}

impl IdempotencyRecord {
    pub fn started(request: Fingerprint) -> Self {
        Self {
            status: IdempotencyStatus::Started,
            request,
            response: None,
        }
    }

    pub fn success(request: Fingerprint, response: serde_json::Value) -> Self {
        Self {
            status: IdempotencyStatus::Success,
            request,
            response: Some(response),
        }
    }

    pub fn is_started(&self) -> bool {
        self.status == IdempotencyStatus::Started
    }

    pub fn is_success(&self) -> bool {
        self.status == IdempotencyStatus::Success
    }
}

/// Keyed persistence for idempotency records.
///
/// `acquire_lock` is the only operation that must be atomic under
/// concurrency: exactly one caller may see `true` while the key has no live
/// record.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Creates a `Started` record iff no live record exists for `key`.
    async fn acquire_lock(&self, key: &str, fingerprint: &Fingerprint, lock_ttl: Duration) -> Result<bool>;

    /// Deletes the record for `key` unconditionally.
    async fn release_lock(&self, key: &str) -> Result<()>;

    /// Returns the live record for `key`, or `None` if it has lapsed.
    async fn load(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Replaces the record for `key`, expiring it after `retention_ttl`.
    async fn save(&self, key: &str, record: &IdempotencyRecord, retention_ttl: Duration) -> Result<()>;
}

#[async_trait]
impl<S: RecordStore + ?Sized> RecordStore for Arc<S> {
    async fn acquire_lock(&self, key: &str, fingerprint: &Fingerprint, lock_ttl: Duration) -> Result<bool> {
        (**self).acquire_lock(key, fingerprint, lock_ttl).await
    }

    async fn release_lock(&self, key: &str) -> Result<()> {
        (**self).release_lock(key).await
    }

    async fn load(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        (**self).load(key).await
    }

    async fn save(&self, key: &str, record: &IdempotencyRecord, retention_ttl: Duration) -> Result<()> {
        (**self).save(key, record, retention_ttl).await
    }
}

/// TTLs must be non-zero.
pub(crate) fn validate_ttl(ttl: Duration) -> Result<Duration> {
    if ttl.is_zero() {
        return Err(AppError::Validation("TTL must be greater than zero".to_string()));
    }
    Ok(ttl)
}

/// Redis-backed record store shared by every process pointing at the same server.
#[derive(Clone)]
pub struct RedisRecordStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisRecordStore {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    /// Opens a store from a Redis URL such as `redis://127.0.0.1:6379`.
    pub fn open(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self::new(client, key_prefix))
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Namespaced Redis key for an idempotency key.
    pub fn make_key(&self, idempotency_key: &str) -> String {
        format!("{}:{}", self.key_prefix, idempotency_key)
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn ttl_millis(ttl: Duration) -> Result<usize> {
        let millis = validate_ttl(ttl)?.as_millis().max(1);
        Ok(usize::try_from(millis).unwrap_or(usize::MAX))
    }

    async fn set_if_absent(&self, idempotency_key: &str, fingerprint: &Fingerprint, lock_ttl: Duration) -> Result<bool> {
        let ttl_ms = Self::ttl_millis(lock_ttl)?;
        let value = serde_json::to_string(&IdempotencyRecord::started(fingerprint.clone()))?;

        let mut conn = self.connection().await?;
        let result: Option<String> = conn
            .set_options(
                self.make_key(idempotency_key),
                value,
                redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::PX(ttl_ms)),
            )
            .await?;

        Ok(result.is_some())
    }

    async fn delete(&self, idempotency_key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: i64 = conn.del(self.make_key(idempotency_key)).await?;
        Ok(())
    }

    async fn get_record(&self, idempotency_key: &str) -> Result<Option<IdempotencyRecord>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(self.make_key(idempotency_key)).await?;

        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set_record(&self, idempotency_key: &str, record: &IdempotencyRecord, retention_ttl: Duration) -> Result<()> {
        let ttl_ms = Self::ttl_millis(retention_ttl)?;
        let value = serde_json::to_string(record)?;

        let mut conn = self.connection().await?;
        let _: () = conn
            .set_options(
                self.make_key(idempotency_key),
                value,
                redis::SetOptions::default().with_expiration(redis::SetExpiry::PX(ttl_ms)),
            )
            .await?;

        Ok(())
    }
}

fn observe<T>(operation: &str, timer: LatencyTimer, result: Result<T>) -> Result<T> {
    get_metrics().record_store_operation("redis", operation, timer.elapsed_ms(), result.is_ok());
    result
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn acquire_lock(&self, key: &str, fingerprint: &Fingerprint, lock_ttl: Duration) -> Result<bool> {
        let timer = LatencyTimer::new();
        let result = self.set_if_absent(key, fingerprint, lock_ttl).await;
        observe("acquire_lock", timer, result)
    }

    async fn release_lock(&self, key: &str) -> Result<()> {
        let timer = LatencyTimer::new();
        let result = self.delete(key).await;
        observe("release_lock", timer, result)
    }

    async fn load(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let timer = LatencyTimer::new();
        let result = self.get_record(key).await;
        observe("load", timer, result)
    }

    async fn save(&self, key: &str, record: &IdempotencyRecord, retention_ttl: Duration) -> Result<()> {
        let timer = LatencyTimer::new();
        let result = self.set_record(key, record, retention_ttl).await;
        observe("save", timer, result)
    }
}
