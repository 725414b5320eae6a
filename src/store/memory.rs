use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

use super::{CacheStore, StoreError};

#[derive(Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    ttl: Option<Duration>,
}

/// Expiry taken from each entry's own TTL
struct PerEntryTtl;

impl Expiry<String, StoredValue> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &StoredValue, _created_at: Instant) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// In-process cache store for single-node deployments and tests
pub struct MemoryCacheStore {
    cache: Cache<String, StoredValue>,
    failing: AtomicBool,
}

impl MemoryCacheStore {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        info!("In-memory cache store initialized");
        Self {
            cache,
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail, for exercising persistence failure paths
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("store unavailable".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(1_000_000)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.cache.get(key).await.map(|v| v.bytes))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check()?;
        self.cache
            .insert(key.to_string(), StoredValue { bytes: value, ttl })
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.cache.invalidate(key).await;
        Ok(())
    }
}
