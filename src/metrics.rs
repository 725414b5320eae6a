use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use utoipa::ToSchema;

/// Direction of a transport message relative to the server
#[derive(Debug, Clone, Copy)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Process-wide counters. Recording never fails and never blocks on I/O.
#[derive(Default)]
pub struct Metrics {
    active_connections: AtomicI64,
    total_connections: AtomicU64,
    connection_millis: AtomicU64,
    collaborator_changes: AtomicU64,
    broker_fallbacks: AtomicU64,
    local_only_deliveries: AtomicU64,
    persistence_failures: AtomicU64,
    messages: Mutex<BTreeMap<String, u64>>,
    document_ops: Mutex<BTreeMap<&'static str, u64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub active_connections: i64,
    pub total_connections: u64,
    pub connection_seconds: u64,
    pub collaborator_changes: u64,
    pub broker_fallbacks: u64,
    pub local_only_deliveries: u64,
    pub persistence_failures: u64,
    pub messages: BTreeMap<String, u64>,
    pub document_ops: BTreeMap<String, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self, duration: Duration) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.connection_millis
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn message(&self, direction: Direction, kind: &str) {
        let key = match direction {
            Direction::Inbound => format!("in:{}", kind),
            Direction::Outbound => format!("out:{}", kind),
        };
        *self.messages.lock().entry(key).or_insert(0) += 1;
    }

    pub fn document_op(&self, op: &'static str) {
        *self.document_ops.lock().entry(op).or_insert(0) += 1;
    }

    pub fn collaborator_changed(&self) {
        self.collaborator_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broker_fallback(&self) {
        self.broker_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// An update applied while the broker was unreachable, seen by this instance only
    pub fn local_only_delivery(&self) {
        self.local_only_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            connection_seconds: self.connection_millis.load(Ordering::Relaxed) / 1000,
            collaborator_changes: self.collaborator_changes.load(Ordering::Relaxed),
            broker_fallbacks: self.broker_fallbacks.load(Ordering::Relaxed),
            local_only_deliveries: self.local_only_deliveries.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            messages: self.messages.lock().clone(),
            document_ops: self
                .document_ops
                .lock()
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }
}
