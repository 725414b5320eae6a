use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{error, info};

use super::{CacheStore, StoreError};

/// Cache store on a shared Redis data connection.
///
/// The connection is established on first use and reconnects on its own afterwards.
pub struct RedisCacheStore {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisCacheStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            conn: OnceCell::new(),
        }
    }

    async fn conn(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let conn = ConnectionManager::new(self.client.clone()).await?;
                info!("Redis cache store connected");
                Ok::<_, redis::RedisError>(conn)
            })
            .await
            .map_err(|e| {
                error!("Failed to connect Redis cache store: {}", e);
                StoreError::Backend(e.to_string())
            })?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let res: redis::RedisResult<()> = match ttl {
            Some(ttl) => conn.set_ex(key, value, ttl.as_secs().max(1)).await,
            None => conn.set(key, value).await,
        };
        res.map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}
