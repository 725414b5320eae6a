use async_trait::async_trait;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),
    #[error("Broker operation timed out")]
    Timeout,
}

/// Messages arriving on one subscribed topic. The stream ends when the subscription is lost.
pub type BrokerStream = BoxStream<'static, Vec<u8>>;

/// Message broker shared by every server instance
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    async fn subscribe(&self, topic: &str) -> Result<BrokerStream, BrokerError>;

    async fn ping(&self) -> Result<(), BrokerError>;

    fn name(&self) -> &'static str;
}

/// In-process broker.
///
/// One instance can be shared by several bridges to stand in for several server
/// processes talking through the same broker. `set_available(false)` simulates an
/// outage: calls fail and every open subscription stream ends. `stall_topic` makes
/// subscribes to one topic hang without answering.
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    stalled: Mutex<HashSet<String>>,
    available: AtomicBool,
    outage: Mutex<CancellationToken>,
    capacity: usize,
}

impl MemoryBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            stalled: Mutex::new(HashSet::new()),
            available: AtomicBool::new(true),
            outage: Mutex::new(CancellationToken::new()),
            capacity,
        }
    }

    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::SeqCst);
        if was && !available {
            let mut outage = self.outage.lock();
            outage.cancel();
            *outage = CancellationToken::new();
        }
    }

    #[cfg(test)]
    pub fn stall_topic(&self, topic: &str) {
        self.stalled.lock().insert(topic.to_string());
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), BrokerError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("memory broker offline".to_string()))
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.check()?;
        if let Some(tx) = self.topics.lock().get(topic) {
            // No receivers is not an error for a broker
            let _ = tx.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BrokerStream, BrokerError> {
        self.check()?;
        let stalled = self.stalled.lock().contains(topic);
        if stalled {
            std::future::pending::<()>().await;
        }
        let rx = {
            let mut topics = self.topics.lock();
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };
        let outage = self.outage.lock().clone();

        let stream = futures_util::stream::unfold((rx, outage), |(mut rx, outage)| async move {
            loop {
                tokio::select! {
                    _ = outage.cancelled() => return None,
                    res = rx.recv() => match res {
                        Ok(payload) => return Some((payload, (rx, outage))),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    },
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.check()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
