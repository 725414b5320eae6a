pub mod bridge;
pub mod broker;
pub mod redis_broker;

pub use bridge::{BridgeConfig, BridgeOutcome, BrokerHealth, PubSubBridge};
pub use broker::{Broker, BrokerError, BrokerStream, MemoryBroker};
pub use redis_broker::RedisBroker;

/// Broker topic carrying applied updates for one document
pub fn doc_topic(doc_id: &str) -> String {
    format!("doc-updates:{}", doc_id)
}
