pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryCacheStore;
pub use redis_store::RedisCacheStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),
    #[error("Store operation timed out")]
    Timeout,
    #[error("Store value could not be decoded: {0}")]
    Decode(String),
}

/// Key/value cache holding encoded document state and metadata
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Run a store call under a deadline so a hung backend cannot stall the caller.
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(StoreError::Timeout),
    }
}

pub fn state_key(doc_id: &str) -> String {
    format!("doc:{}:state", doc_id)
}

pub fn meta_key(doc_id: &str) -> String {
    format!("doc:{}:meta", doc_id)
}
