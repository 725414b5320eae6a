use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::models::UpdateEnvelope;
use crate::services::doc_sync_service::{DocSyncService, ListenerHandle};
use crate::ws::outbox::Outbox;
use crate::ws::registry::ConnectionRegistry;

#[derive(Default)]
struct Slot {
    interested: HashSet<String>,
    listener: Option<ListenerHandle>,
    dispatch: Option<JoinHandle<()>>,
    /// Set once the slot has been torn down and removed from the map
    retired: bool,
}

/// One engine listener per document, shared by every local connection interested in it.
///
/// Each document has its own async lock, so the first-subscriber and last-unsubscriber
/// transitions for one document never interleave while other documents proceed freely.
pub struct SubscriptionManager {
    engine: Arc<DocSyncService>,
    registry: Arc<ConnectionRegistry>,
    outbox: Arc<Outbox>,
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Slot>>>>,
    by_connection: Mutex<HashMap<String, HashSet<String>>>,
}

impl SubscriptionManager {
    pub fn new(engine: Arc<DocSyncService>, registry: Arc<ConnectionRegistry>, outbox: Arc<Outbox>) -> Self {
        Self {
            engine,
            registry,
            outbox,
            slots: Mutex::new(HashMap::new()),
            by_connection: Mutex::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self, doc_id: &str, conn_id: &str) {
        loop {
            let slot = self
                .slots
                .lock()
                .entry(doc_id.to_string())
                .or_default()
                .clone();
            let mut slot = slot.lock().await;
            if slot.retired {
                // Lost a race with the last unsubscribe; take a fresh slot
                continue;
            }

            if slot.interested.is_empty() {
                let (handle, rx) = self.engine.on_update(doc_id).await;
                slot.listener = Some(handle);
                slot.dispatch = Some(self.spawn_dispatch(doc_id, rx));
                info!("Subscribed to updates for document {}", doc_id);
            }
            slot.interested.insert(conn_id.to_string());
            self.by_connection
                .lock()
                .entry(conn_id.to_string())
                .or_default()
                .insert(doc_id.to_string());
            return;
        }
    }

    pub async fn unsubscribe(&self, doc_id: &str, conn_id: &str) {
        if let Some(docs) = self.by_connection.lock().get_mut(conn_id) {
            docs.remove(doc_id);
        }
        self.release(doc_id, conn_id).await;
    }

    /// Drop every interest held by a connection
    pub async fn cleanup_connection(&self, conn_id: &str) {
        let docs = self.by_connection.lock().remove(conn_id).unwrap_or_default();
        for doc_id in docs {
            self.release(&doc_id, conn_id).await;
        }
    }

    async fn release(&self, doc_id: &str, conn_id: &str) {
        let Some(slot_ref) = self.slots.lock().get(doc_id).cloned() else {
            return;
        };
        let mut slot = slot_ref.lock().await;
        if slot.retired || !slot.interested.remove(conn_id) || !slot.interested.is_empty() {
            return;
        }

        slot.retired = true;
        {
            let mut slots = self.slots.lock();
            if slots.get(doc_id).is_some_and(|current| Arc::ptr_eq(current, &slot_ref)) {
                slots.remove(doc_id);
            }
        }
        if let Some(dispatch) = slot.dispatch.take() {
            dispatch.abort();
        }
        if let Some(listener) = slot.listener.take() {
            listener.unsubscribe().await;
        }
        info!("Unsubscribed from updates for document {}", doc_id);
    }

    fn spawn_dispatch(&self, doc_id: &str, mut rx: mpsc::UnboundedReceiver<UpdateEnvelope>) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let outbox = self.outbox.clone();
        let doc_id = doc_id.to_string();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let room = registry.room_connections(&doc_id);
                let message = envelope.to_client_message();
                let sent = outbox.broadcast(&room, envelope.origin_connection.as_deref(), &message);
                debug!("Fanned out update for {} to {} connections", doc_id, sent);
            }
        })
    }

    /// Connections interested in `doc_id`, as held by the document's slot
    pub async fn interest_count(&self, doc_id: &str) -> usize {
        let slot = self.slots.lock().get(doc_id).cloned();
        match slot {
            Some(slot) => slot.lock().await.interested.len(),
            None => 0,
        }
    }

    pub fn is_subscribed(&self, doc_id: &str) -> bool {
        self.slots.lock().contains_key(doc_id)
    }

    pub fn subscribed_count(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn documents_for(&self, conn_id: &str) -> Vec<String> {
        self.by_connection
            .lock()
            .get(conn_id)
            .map(|docs| docs.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::lorodoc::text_update;
    use crate::pubsub::doc_topic;
    use crate::testutil::TestStack;
    use crate::ws::outbox::Outbound;
    use crate::models::ServerMessage;

    #[tokio::test]
    async fn one_engine_listener_per_document() {
        let stack = TestStack::new().await;
        let doc = stack.engine.create_document("alice", "Doc", true).await.unwrap();
        let topic = doc_topic(&doc.id);

        stack.subscriptions.subscribe(&doc.id, "c1").await;
        stack.subscriptions.subscribe(&doc.id, "c2").await;
        stack.subscriptions.subscribe(&doc.id, "c2").await;
        assert_eq!(stack.engine.listener_count(&doc.id), 1);
        assert_eq!(stack.subscriptions.interest_count(&doc.id).await, 2);
        assert!(stack.bridge.is_subscribed(&topic));

        stack.subscriptions.unsubscribe(&doc.id, "c1").await;
        assert!(stack.bridge.is_subscribed(&topic));
        assert_eq!(stack.engine.listener_count(&doc.id), 1);

        stack.subscriptions.unsubscribe(&doc.id, "c2").await;
        assert!(!stack.subscriptions.is_subscribed(&doc.id));
        assert!(!stack.bridge.is_subscribed(&topic));
        assert_eq!(stack.engine.listener_count(&doc.id), 0);

        // Unsubscribing again is harmless
        stack.subscriptions.unsubscribe(&doc.id, "c2").await;
    }

    #[tokio::test]
    async fn cleanup_releases_every_document() {
        let stack = TestStack::new().await;
        let a = stack.engine.create_document("alice", "A", true).await.unwrap();
        let b = stack.engine.create_document("alice", "B", true).await.unwrap();

        stack.subscriptions.subscribe(&a.id, "c1").await;
        stack.subscriptions.subscribe(&b.id, "c1").await;
        stack.subscriptions.subscribe(&b.id, "c2").await;

        stack.subscriptions.cleanup_connection("c1").await;
        assert!(!stack.subscriptions.is_subscribed(&a.id));
        assert!(!stack.bridge.is_subscribed(&doc_topic(&a.id)));
        assert_eq!(stack.subscriptions.interest_count(&b.id).await, 1);
        assert!(stack.subscriptions.documents_for("c1").is_empty());
    }

    #[tokio::test]
    async fn concurrent_subscribers_share_one_slot() {
        let stack = TestStack::new().await;
        let doc = stack.engine.create_document("alice", "Doc", true).await.unwrap();
        let manager = stack.subscriptions.clone();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let manager = manager.clone();
            let doc_id = doc.id.clone();
            tasks.push(tokio::spawn(async move {
                manager.subscribe(&doc_id, &format!("c{}", i)).await;
                if i % 2 == 0 {
                    manager.unsubscribe(&doc_id, &format!("c{}", i)).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(manager.interest_count(&doc.id).await, 8);
        assert_eq!(stack.engine.listener_count(&doc.id), 1);
        assert!(stack.bridge.is_subscribed(&doc_topic(&doc.id)));
    }

    #[tokio::test]
    async fn interest_is_counted_from_the_document_slot() {
        let stack = TestStack::new().await;
        let doc = stack.engine.create_document("alice", "Doc", true).await.unwrap();
        stack.subscriptions.subscribe(&doc.id, "c1").await;

        // Per-connection bookkeeping that has not caught up yet does not count
        stack
            .subscriptions
            .by_connection
            .lock()
            .entry("stale".to_string())
            .or_default()
            .insert(doc.id.clone());
        assert_eq!(stack.subscriptions.interest_count(&doc.id).await, 1);

        stack.subscriptions.unsubscribe(&doc.id, "c1").await;
        assert_eq!(stack.subscriptions.interest_count(&doc.id).await, 0);
        assert_eq!(stack.subscriptions.interest_count("never-subscribed").await, 0);
    }

    #[tokio::test]
    async fn dispatch_fans_out_to_room_except_origin() {
        let stack = TestStack::new().await;
        let doc = stack.engine.create_document("alice", "Doc", true).await.unwrap();
        let mut alice = stack.connect("alice").await;
        let mut bob = stack.connect("bob").await;
        for conn in [&alice.conn_id, &bob.conn_id] {
            stack.registry.join_document(conn, &doc.id);
            stack.subscriptions.subscribe(&doc.id, conn).await;
        }

        let update = text_update(1, "hi");
        stack
            .engine
            .apply_update(&doc.id, "alice", &update, Some(&alice.conn_id))
            .await
            .unwrap();

        match bob.next().await {
            Outbound::Message(ServerMessage::DocumentUpdate(msg)) => assert_eq!(msg.update, update),
            other => panic!("unexpected {:?}", other),
        }
        alice.assert_silent().await;
    }
}
