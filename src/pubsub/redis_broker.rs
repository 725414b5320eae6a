use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::OnceCell;
use tracing::{error, info};

use super::broker::{Broker, BrokerError, BrokerStream};

/// Redis pub/sub broker.
///
/// Health checks run on the data connection, publishes on a dedicated publisher
/// connection, and every subscription opens its own subscriber connection, so a blocked
/// subscriber never starves the other two.
pub struct RedisBroker {
    client: redis::Client,
    data: OnceCell<ConnectionManager>,
    publisher: OnceCell<ConnectionManager>,
}

impl RedisBroker {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            data: OnceCell::new(),
            publisher: OnceCell::new(),
        }
    }

    async fn connection(&self, cell: &OnceCell<ConnectionManager>, role: &'static str) -> Result<ConnectionManager, BrokerError> {
        let conn = cell
            .get_or_try_init(|| async {
                let conn = ConnectionManager::new(self.client.clone()).await?;
                info!("Redis {} connection established", role);
                Ok::<_, redis::RedisError>(conn)
            })
            .await
            .map_err(|e| {
                error!("Failed to open Redis {} connection: {}", role, e);
                BrokerError::Unavailable(e.to_string())
            })?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut conn = self.connection(&self.publisher, "publisher").await?;
        let _: () = conn
            .publish(topic, payload)
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BrokerStream, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<Vec<u8>>().ok() });
        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.connection(&self.data, "data").await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
