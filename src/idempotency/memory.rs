use crate::error::Result;
use crate::idempotency::fingerprint::Fingerprint;
use crate::idempotency::storage::{validate_ttl, IdempotencyRecord, RecordStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    record: IdempotencyRecord,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process record store for tests and single-instance deployments.
///
/// Expiry is checked lazily whenever a key is touched; nothing sweeps the map
/// in the background. Records are not visible to other processes.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records that have not expired.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops expired records and returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed, "purged expired idempotency records");
        }
        removed
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn acquire_lock(&self, key: &str, fingerprint: &Fingerprint, lock_ttl: Duration) -> Result<bool> {
        let lock_ttl = validate_ttl(lock_ttl)?;
        let now = Instant::now();

        // Check and insert under the same write guard.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                record: IdempotencyRecord::started(fingerprint.clone()),
                expires_at: now + lock_ttl,
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.record.clone()))
    }

    async fn save(&self, key: &str, record: &IdempotencyRecord, retention_ttl: Duration) -> Result<()> {
        let retention_ttl = validate_ttl(retention_ttl)?;
        let expires_at = Instant::now() + retention_ttl;

        self.entries.write().await.insert(
            key.to_string(),
            Entry {
                record: record.clone(),
                expires_at,
            },
        );
        Ok(())
    }
}
