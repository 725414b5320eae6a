use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::metrics::{Direction, Metrics};
use crate::models::ServerMessage;

/// Something to write to a socket
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Close { code: u16, reason: String },
}

/// Per-connection send queues. Each socket's writer task drains its own queue, so a
/// slow client never blocks a sender.
pub struct Outbox {
    senders: RwLock<HashMap<String, mpsc::UnboundedSender<Outbound>>>,
    metrics: Arc<Metrics>,
}

impl Outbox {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn register(&self, conn_id: &str) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.write().insert(conn_id.to_string(), tx);
        rx
    }

    pub fn unregister(&self, conn_id: &str) {
        self.senders.write().remove(conn_id);
    }

    /// Queue a message; false if the connection is gone
    pub fn send(&self, conn_id: &str, message: ServerMessage) -> bool {
        let kind = message.kind();
        let sent = self.push(conn_id, Outbound::Message(message));
        if sent {
            self.metrics.message(Direction::Outbound, kind);
        }
        sent
    }

    /// Send to every listed connection except `exclude`. Returns the number queued.
    pub fn broadcast<'a, I>(&self, conn_ids: I, exclude: Option<&str>, message: &ServerMessage) -> usize
    where
        I: IntoIterator<Item = &'a String>,
    {
        conn_ids
            .into_iter()
            .filter(|id| Some(id.as_str()) != exclude)
            .filter(|id| self.send(id, message.clone()))
            .count()
    }

    pub fn close(&self, conn_id: &str, code: u16, reason: &str) -> bool {
        self.push(
            conn_id,
            Outbound::Close {
                code,
                reason: reason.to_string(),
            },
        )
    }

    pub fn is_registered(&self, conn_id: &str) -> bool {
        self.senders.read().contains_key(conn_id)
    }

    fn push(&self, conn_id: &str, outbound: Outbound) -> bool {
        let senders = self.senders.read();
        match senders.get(conn_id) {
            Some(tx) => tx.send(outbound).is_ok(),
            None => {
                debug!("Dropping message for unknown connection {}", conn_id);
                false
            }
        }
    }
}
