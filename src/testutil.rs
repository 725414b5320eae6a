//! Shared fixtures: a complete in-memory stack and a client that speaks to it.

use serde::Serialize;
use serde_with::{base64::Base64, serde_as};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::auth::InMemoryUserDirectory;
use crate::config::Config;
use crate::models::{Role, ServerMessage, User};
use crate::pubsub::MemoryBroker;
use crate::services::auth_service::issue_jwt;
use crate::state::{AppState, Backends};
use crate::store::MemoryCacheStore;
use crate::ws::{Outbound, Session};

pub const TEST_SECRET: &str = "test-secret";

pub struct TestStack {
    pub state: AppState,
    pub broker: Arc<MemoryBroker>,
    pub store: Arc<MemoryCacheStore>,
    pub directory: Arc<InMemoryUserDirectory>,
}

impl Deref for TestStack {
    type Target = AppState;

    fn deref(&self) -> &AppState {
        &self.state
    }
}

impl TestStack {
    pub async fn new() -> Self {
        Self::with_auth_timeout(Duration::from_secs(30)).await
    }

    pub async fn with_auth_timeout(auth_timeout: Duration) -> Self {
        Self::on(Arc::new(MemoryBroker::default()), Arc::new(MemoryCacheStore::default()), auth_timeout).await
    }

    /// Build a stack over a given broker and store, so several stacks can stand in for
    /// several server instances
    pub async fn on(broker: Arc<MemoryBroker>, store: Arc<MemoryCacheStore>, auth_timeout: Duration) -> Self {
        let directory = Arc::new(InMemoryUserDirectory::new());
        for (id, role) in [
            ("alice", Role::Editor),
            ("bob", Role::Editor),
            ("carol", Role::Viewer),
            ("root", Role::Admin),
        ] {
            directory.insert(User {
                id: id.to_string(),
                username: id.to_string(),
                role,
            });
        }

        let config = Config {
            jwt_secret: Some(TEST_SECRET.to_string()),
            auth_timeout_secs: auth_timeout.as_secs(),
            ..Config::default()
        };
        let backends = Backends {
            store: store.clone(),
            broker: broker.clone(),
            directory: directory.clone(),
        };
        let state = AppState::assemble(config, backends).await;
        Self {
            state,
            broker,
            store,
            directory,
        }
    }

    pub fn token(user_id: &str) -> String {
        issue_jwt(user_id, "user", TEST_SECRET, Duration::from_secs(3600)).unwrap()
    }

    /// Open a connection authenticated at handshake, with the `authenticated` event consumed
    pub async fn connect(&self, user_id: &str) -> TestClient {
        let (session, rx) = self.protocol.open(Some(Self::token(user_id))).await;
        let mut client = TestClient::new(session, rx);
        match client.next_message().await {
            ServerMessage::Authenticated(_) => {}
            other => panic!("expected authenticated, got {:?}", other),
        }
        client
    }

    pub async fn connect_anonymous(&self) -> TestClient {
        let (session, rx) = self.protocol.open(None).await;
        TestClient::new(session, rx)
    }
}

pub struct TestClient {
    pub conn_id: String,
    pub session: Session,
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl TestClient {
    fn new(session: Session, rx: mpsc::UnboundedReceiver<Outbound>) -> Self {
        Self {
            conn_id: session.conn_id().to_string(),
            session,
            rx,
        }
    }

    pub async fn send(&mut self, stack: &TestStack, message: serde_json::Value) {
        self.send_raw(stack, &message.to_string()).await;
    }

    pub async fn send_raw(&mut self, stack: &TestStack, text: &str) {
        stack.protocol.handle_text(&mut self.session, text).await;
    }

    /// Join `doc_id` and consume the `document-joined` reply
    pub async fn join(&mut self, stack: &TestStack, doc_id: &str) {
        self.send(stack, serde_json::json!({"type": "join-document", "documentId": doc_id}))
            .await;
        match self.next_message().await {
            ServerMessage::DocumentJoined(joined) => assert_eq!(joined.document_id, doc_id),
            other => panic!("expected document-joined, got {:?}", other),
        }
    }

    pub async fn disconnect(&mut self, stack: &TestStack) {
        stack.protocol.disconnect(&mut self.session, "test disconnect").await;
    }

    pub async fn next(&mut self) -> Outbound {
        match tokio::time::timeout(Duration::from_secs(2), self.rx.recv()).await {
            Ok(Some(outbound)) => outbound,
            Ok(None) => panic!("outbox closed for {}", self.conn_id),
            Err(_) => panic!("no message for {} within 2s", self.conn_id),
        }
    }

    pub async fn next_message(&mut self) -> ServerMessage {
        match self.next().await {
            Outbound::Message(message) => message,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    pub fn try_next(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }

    pub fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }

    /// Give in-flight fan-out a moment, then check nothing arrived
    pub async fn assert_silent(&mut self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Ok(outbound) = self.rx.try_recv() {
            panic!("unexpected message for {}: {:?}", self.conn_id, outbound);
        }
    }
}

/// Let spawned tasks run after the paused clock moved
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[serde_as]
#[derive(Serialize)]
struct Encoded(#[serde_as(as = "Base64")] Vec<u8>);

/// Base64 form of an update, as clients put it on the wire
pub fn encode_update(update: &[u8]) -> String {
    match serde_json::to_value(Encoded(update.to_vec())) {
        Ok(serde_json::Value::String(encoded)) => encoded,
        other => panic!("unexpected encoding {:?}", other),
    }
}
