use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::config::Config;
use crate::metrics::Metrics;
use super::broker::{Broker, BrokerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum BrokerHealth {
    Disconnected,
    Connecting,
    Connected,
    Fallback,
    Reconnecting,
}

impl fmt::Display for BrokerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerHealth::Disconnected => write!(f, "disconnected"),
            BrokerHealth::Connecting => write!(f, "connecting"),
            BrokerHealth::Connected => write!(f, "connected"),
            BrokerHealth::Fallback => write!(f, "fallback"),
            BrokerHealth::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Result of every bridge operation. Broker outages are reported here, never as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeOutcome {
    pub delivered: bool,
    pub fallback: bool,
}

impl BridgeOutcome {
    const DELIVERED: BridgeOutcome = BridgeOutcome { delivered: true, fallback: false };
    const FALLBACK: BridgeOutcome = BridgeOutcome { delivered: false, fallback: true };
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub ping_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub op_timeout: Duration,
}

impl BridgeConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ping_interval: config.broker_ping_interval(),
            backoff_base: config.broker_backoff_base(),
            backoff_cap: config.broker_backoff_cap(),
            op_timeout: config.downstream_timeout(),
        }
    }

    /// Delay before reconnect attempt `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Upper bound on re-attach sweeps per recovery, in case subscribes keep arriving
const REATTACH_PASSES: usize = 4;

/// A topic this process wants to hear. `pump` forwards broker messages into `tx` while
/// attached; the entry survives outages and is re-attached on recovery.
struct TopicEntry {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pump: Option<JoinHandle<()>>,
}

impl TopicEntry {
    fn is_attached(&self) -> bool {
        self.pump.as_ref().is_some_and(|h| !h.is_finished())
    }
}

pub struct PubSubBridge {
    broker: Arc<dyn Broker>,
    config: BridgeConfig,
    metrics: Arc<Metrics>,
    health: RwLock<BrokerHealth>,
    topics: Mutex<HashMap<String, TopicEntry>>,
    reconnecting: AtomicBool,
    cancel: CancellationToken,
}

impl PubSubBridge {
    pub fn new(broker: Arc<dyn Broker>, config: BridgeConfig, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            broker,
            config,
            metrics,
            health: RwLock::new(BrokerHealth::Disconnected),
            topics: Mutex::new(HashMap::new()),
            reconnecting: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Verify the broker once and start the liveness ping loop
    pub async fn start(self: &Arc<Self>) {
        self.set_health(BrokerHealth::Connecting);
        match self.timed(self.broker.ping()).await {
            Ok(()) => {
                self.set_health(BrokerHealth::Connected);
                info!("Broker '{}' connected", self.broker.name());
            }
            Err(e) => self.enter_fallback(&e.to_string()),
        }

        let bridge = self.clone();
        tokio::spawn(async move { bridge.ping_loop().await });
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        let mut topics = self.topics.lock();
        for (_, entry) in topics.drain() {
            if let Some(pump) = entry.pump {
                pump.abort();
            }
        }
    }

    pub fn health(&self) -> BrokerHealth {
        *self.health.read()
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.health(), BrokerHealth::Fallback | BrokerHealth::Reconnecting)
    }

    /// Whether this process currently holds a subscription (attached or pending) for `topic`
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.lock().contains_key(topic)
    }

    /// Whether the subscription for `topic` is live on the broker right now
    pub fn is_attached(&self, topic: &str) -> bool {
        self.topics.lock().get(topic).is_some_and(TopicEntry::is_attached)
    }

    pub fn subscription_count(&self) -> usize {
        self.topics.lock().len()
    }

    pub async fn publish(self: &Arc<Self>, topic: &str, payload: Vec<u8>) -> BridgeOutcome {
        if self.is_fallback() {
            return BridgeOutcome::FALLBACK;
        }
        match self.timed(self.broker.publish(topic, payload)).await {
            Ok(()) => BridgeOutcome::DELIVERED,
            Err(e) => {
                error!("Publish to '{}' failed: {}", topic, e);
                self.enter_fallback(&e.to_string());
                BridgeOutcome::FALLBACK
            }
        }
    }

    /// Subscribe to `topic`. The returned receiver keeps working across broker outages;
    /// while in fallback the subscription is recorded and attached once the broker is back.
    pub async fn subscribe(self: &Arc<Self>, topic: &str) -> (BridgeOutcome, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut topics = self.topics.lock();
            if let Some(old) = topics.insert(topic.to_string(), TopicEntry { tx: tx.clone(), pump: None }) {
                if let Some(pump) = old.pump {
                    pump.abort();
                }
            }
        }

        if self.is_fallback() {
            debug!("Subscription to '{}' deferred, broker in fallback", topic);
            return (BridgeOutcome::FALLBACK, rx);
        }

        match self.attach(topic, tx).await {
            Ok(()) => (BridgeOutcome::DELIVERED, rx),
            Err(e) => {
                error!("Subscribe to '{}' failed: {}", topic, e);
                self.enter_fallback(&e.to_string());
                (BridgeOutcome::FALLBACK, rx)
            }
        }
    }

    pub async fn unsubscribe(&self, topic: &str) -> BridgeOutcome {
        let removed = self.topics.lock().remove(topic);
        if let Some(pump) = removed.and_then(|entry| entry.pump) {
            pump.abort();
        }
        if self.is_fallback() {
            BridgeOutcome::FALLBACK
        } else {
            BridgeOutcome::DELIVERED
        }
    }

    async fn attach(self: &Arc<Self>, topic: &str, tx: mpsc::UnboundedSender<Vec<u8>>) -> Result<(), BrokerError> {
        let mut stream = self.timed(self.broker.subscribe(topic)).await?;

        let bridge = Arc::downgrade(self);
        let topic_owned = topic.to_string();
        let pump_tx = tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(payload) = stream.next().await {
                if pump_tx.send(payload).is_err() {
                    return;
                }
            }
            if let Some(bridge) = bridge.upgrade() {
                if bridge.is_subscribed(&topic_owned) && !bridge.cancel.is_cancelled() {
                    warn!("Subscription to '{}' lost", topic_owned);
                    bridge.enter_fallback("subscription stream ended");
                }
            }
        });

        let mut topics = self.topics.lock();
        match topics.get_mut(topic) {
            // Only keep the pump if the entry it was built for is still the current one
            Some(entry) if entry.tx.same_channel(&tx) => {
                if let Some(previous) = entry.pump.replace(pump) {
                    previous.abort();
                }
            }
            _ => pump.abort(),
        }
        Ok(())
    }

    fn set_health(&self, health: BrokerHealth) {
        let mut current = self.health.write();
        if *current != health {
            debug!("Broker health {} -> {}", *current, health);
            *current = health;
        }
    }

    fn enter_fallback(self: &Arc<Self>, reason: &str) {
        {
            let mut health = self.health.write();
            if !matches!(*health, BrokerHealth::Fallback | BrokerHealth::Reconnecting) {
                warn!("Broker '{}' unreachable ({}), switching to local-only delivery", self.broker.name(), reason);
                *health = BrokerHealth::Fallback;
                self.metrics.broker_fallback();
            }
        }
        if !self.reconnecting.swap(true, Ordering::SeqCst) {
            let bridge = self.clone();
            tokio::spawn(async move { bridge.reconnect_loop().await });
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            let delay = self.config.backoff(attempt);
            self.set_health(BrokerHealth::Reconnecting);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.timed(self.broker.ping()).await {
                Ok(()) => {
                    if self.recover().await {
                        break;
                    }
                }
                Err(e) => debug!("Reconnect attempt {} failed: {}", attempt + 1, e),
            }
            attempt = attempt.saturating_add(1);
        }
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    /// Re-attach every detached topic. Returns true once the bridge is connected again.
    async fn recover(self: &Arc<Self>) -> bool {
        if !self.reattach_detached().await {
            return false;
        }
        self.set_health(BrokerHealth::Connected);
        info!("Broker '{}' reachable again, cross-instance delivery restored", self.broker.name());

        // Subscribes that still saw fallback while the pass above ran
        if !self.reattach_detached().await {
            debug!("Some subscriptions stay detached until the next ping");
        }
        true
    }

    /// Attach every topic without a live pump, repeating while new ones show up.
    /// Returns false on the first broker failure.
    async fn reattach_detached(self: &Arc<Self>) -> bool {
        for _ in 0..REATTACH_PASSES {
            let detached: Vec<(String, mpsc::UnboundedSender<Vec<u8>>)> = self
                .topics
                .lock()
                .iter()
                .filter(|(_, entry)| !entry.is_attached())
                .map(|(topic, entry)| (topic.clone(), entry.tx.clone()))
                .collect();
            if detached.is_empty() {
                return true;
            }

            for (topic, tx) in detached {
                if let Err(e) = self.attach(&topic, tx).await {
                    debug!("Re-subscribe to '{}' failed: {}", topic, e);
                    return false;
                }
            }
        }
        true
    }

    async fn ping_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.ping_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            if self.reconnecting.load(Ordering::SeqCst) {
                continue;
            }
            match self.timed(self.broker.ping()).await {
                Ok(()) => {
                    if self.health() != BrokerHealth::Connected {
                        self.recover().await;
                    } else if !self.reattach_detached().await {
                        self.enter_fallback("re-subscribe failed");
                    }
                }
                Err(e) => self.enter_fallback(&e.to_string()),
            }
        }
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, BrokerError>
    where
        F: std::future::Future<Output = Result<T, BrokerError>>,
    {
        match tokio::time::timeout(self.config.op_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(BrokerError::Timeout),
        }
    }
}
