use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::IdentityStore;
use crate::metrics::{Direction, Metrics};
use crate::models::{
    AuthWarningMessage, AuthenticatedMessage, ClientMessage, DocumentJoinedMessage, DocumentLeftMessage, ErrorCode,
    MemberInfo, Principal, ServerCursorMessage, ServerMessage, UpdateSuccessMessage, UserLeftMessage,
};
use crate::services::doc_sync_service::{DocSyncService, SyncError};
use crate::ws::outbox::{Outbound, Outbox};
use crate::ws::registry::ConnectionRegistry;
use crate::ws::subscriptions::SubscriptionManager;

/// Close code sent when a connection fails to authenticate in time
pub const AUTH_TIMEOUT_CLOSE: u16 = 4001;
/// Close code sent when every session of a user is force-closed
pub const FORCED_CLOSE: u16 = 4003;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AuthPending,
    Authenticated,
    InDocument(String),
    Closed,
}

/// Per-socket protocol state. Owned by the socket's reader loop, so every message of one
/// connection is handled in order.
pub struct Session {
    conn_id: String,
    state: SessionState,
    principal: Option<Principal>,
    connected_at: DateTime<Utc>,
    opened: Instant,
    authenticated: Arc<AtomicBool>,
    deadline: Option<JoinHandle<()>>,
}

impl Session {
    fn new(conn_id: String) -> Self {
        Self {
            conn_id,
            state: SessionState::Connecting,
            principal: None,
            connected_at: Utc::now(),
            opened: Instant::now(),
            authenticated: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn current_document(&self) -> Option<&str> {
        match &self.state {
            SessionState::InDocument(doc_id) => Some(doc_id),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    fn cancel_deadline(&mut self) {
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
    }
}

/// Drives the connection state machine. The handler never touches storage itself; it
/// talks to the client through the outbox and delegates documents to the engine.
pub struct ProtocolHandler {
    registry: Arc<ConnectionRegistry>,
    engine: Arc<DocSyncService>,
    subscriptions: Arc<SubscriptionManager>,
    outbox: Arc<Outbox>,
    identity: Arc<dyn IdentityStore>,
    metrics: Arc<Metrics>,
    auth_timeout: Duration,
}

impl ProtocolHandler {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        engine: Arc<DocSyncService>,
        subscriptions: Arc<SubscriptionManager>,
        outbox: Arc<Outbox>,
        identity: Arc<dyn IdentityStore>,
        metrics: Arc<Metrics>,
        auth_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            engine,
            subscriptions,
            outbox,
            identity,
            metrics,
            auth_timeout,
        }
    }

    /// Accept a transport connection. With handshake credentials the session tries to
    /// authenticate straight away; the deadline runs until some authentication succeeds.
    pub async fn open(&self, handshake_token: Option<String>) -> (Session, mpsc::UnboundedReceiver<Outbound>) {
        let conn_id = Uuid::new_v4().to_string();
        let rx = self.outbox.register(&conn_id);
        self.metrics.connection_opened();
        info!("Connection {} opened", conn_id);

        let mut session = Session::new(conn_id);
        session.state = SessionState::AuthPending;
        self.start_deadline(&mut session);

        if let Some(token) = handshake_token {
            match self.identity.authenticate(Some(&token)).await {
                Ok(principal) => self.complete_authentication(&mut session, principal).await,
                Err(e) => {
                    warn!("Handshake authentication failed for {}: {}", session.conn_id, e);
                    self.send(&session, ServerMessage::auth_error(e.code(), auth_failure_message(e.code())));
                }
            }
        }
        (session, rx)
    }

    /// Handle one inbound text frame
    pub async fn handle_text(&self, session: &mut Session, text: &str) {
        if session.is_closed() {
            return;
        }
        match ClientMessage::parse(text) {
            Ok(message) => {
                self.metrics.message(Direction::Inbound, message.kind());
                debug!("Connection {} sent {}", session.conn_id, message.kind());
                self.dispatch(session, message).await;
            }
            Err((code, message)) => {
                self.metrics.message(Direction::Inbound, "invalid");
                debug!("Connection {} sent an invalid frame: {}", session.conn_id, message);
                self.send(session, ServerMessage::error(code, message));
            }
        }
    }

    /// Answer a frame the protocol cannot carry; the connection stays open
    pub fn reject_frame(&self, session: &Session, reason: &str) {
        self.metrics.message(Direction::Inbound, "invalid");
        self.send(session, ServerMessage::error(ErrorCode::InvalidMessage, reason));
    }

    async fn dispatch(&self, session: &mut Session, message: ClientMessage) {
        match message {
            ClientMessage::Authenticate(msg) => self.authenticate(session, msg.token.as_deref()).await,
            ClientMessage::JoinDocument(msg) => self.join_document(session, msg.document_id.as_deref()).await,
            ClientMessage::LeaveDocument(msg) => self.leave_document(session, msg.document_id.as_deref()).await,
            ClientMessage::DocumentUpdate(msg) => {
                self.apply_update(session, msg.document_id.as_deref(), msg.update.as_deref())
                    .await
            }
            ClientMessage::CursorUpdate(msg) => self.cursor_update(session, msg.document_id.as_deref(), msg.cursor),
        }
    }

    pub async fn authenticate(&self, session: &mut Session, token: Option<&str>) {
        match self.identity.authenticate(token).await {
            Ok(principal) => self.complete_authentication(session, principal).await,
            Err(e) => {
                warn!("Authentication failed for {}: {}", session.conn_id, e);
                self.send(session, ServerMessage::auth_error(e.code(), auth_failure_message(e.code())));
            }
        }
    }

    async fn complete_authentication(&self, session: &mut Session, principal: Principal) {
        session.authenticated.store(true, Ordering::SeqCst);
        session.cancel_deadline();

        // Re-authentication replaces the identity, so drop any room held under the old one
        if let SessionState::InDocument(doc_id) = session.state.clone() {
            self.leave_room(session, &doc_id).await;
        }

        if !self
            .registry
            .add_connection(&session.conn_id, Some(principal.clone()), session.connected_at)
        {
            self.send(session, ServerMessage::auth_error(ErrorCode::AuthFailed, "Authentication failed"));
            return;
        }

        info!("Connection {} authenticated as {} ({})", session.conn_id, principal.username, principal.role);
        self.send(
            session,
            ServerMessage::Authenticated(AuthenticatedMessage {
                user_id: principal.user_id.clone(),
                username: principal.username.clone(),
                role: principal.role,
                permissions: principal.permissions.clone(),
            }),
        );
        session.principal = Some(principal);
        session.state = SessionState::Authenticated;
    }

    pub async fn join_document(&self, session: &mut Session, doc_id: Option<&str>) {
        let Some(principal) = session.principal.clone() else {
            self.send(session, ServerMessage::error(ErrorCode::NotAuthenticated, "Not authenticated"));
            return;
        };
        let Some(doc_id) = doc_id.filter(|id| !id.is_empty()) else {
            self.send(session, ServerMessage::error(ErrorCode::DocumentIdRequired, "Document ID required"));
            return;
        };

        let access = match self.engine.access(doc_id, &principal.user_id).await {
            Ok(access) => access,
            Err(SyncError::NotFound(_)) => {
                self.send(session, ServerMessage::error(ErrorCode::DocumentNotFound, "Document not found"));
                return;
            }
            Err(e) => {
                error!("Access check for {} on {} failed: {}", principal.user_id, doc_id, e);
                self.send(session, ServerMessage::error(ErrorCode::JoinFailed, "Failed to join document"));
                return;
            }
        };
        if !access.read {
            warn!("User {} denied access to document {}", principal.user_id, doc_id);
            self.send(session, ServerMessage::error(ErrorCode::AccessDenied, "Access denied"));
            return;
        }

        let (document_state, metadata) = match self.engine.get_document(doc_id).await {
            Ok(document) => document,
            Err(e) => {
                error!("Loading document {} for join failed: {}", doc_id, e);
                self.send(session, ServerMessage::error(ErrorCode::JoinFailed, "Failed to join document"));
                return;
            }
        };

        let rejoin = session.current_document() == Some(doc_id);
        if let Some(current) = session.current_document().map(str::to_string) {
            if !rejoin {
                self.leave_room(session, &current).await;
            }
        }

        let first_session_in_room = !self.user_in_room(doc_id, &principal.user_id);
        if self.registry.join_document(&session.conn_id, doc_id).is_none() {
            self.send(session, ServerMessage::error(ErrorCode::JoinFailed, "Failed to join document"));
            return;
        }
        self.subscriptions.subscribe(doc_id, &session.conn_id).await;
        session.state = SessionState::InDocument(doc_id.to_string());

        let users = self
            .registry
            .list_document_members(doc_id)
            .into_iter()
            .filter(|member| member.user_id != principal.user_id)
            .collect();
        self.send(
            session,
            ServerMessage::DocumentJoined(DocumentJoinedMessage {
                document_id: doc_id.to_string(),
                users,
                document_state,
                metadata,
                has_write_access: access.write,
            }),
        );

        if !rejoin && first_session_in_room {
            let joined = ServerMessage::UserJoined(MemberInfo {
                user_id: principal.user_id.clone(),
                username: principal.username.clone(),
                role: principal.role,
            });
            self.outbox
                .broadcast(&self.registry.room_connections(doc_id), Some(&session.conn_id), &joined);
        }
        self.metrics.document_op("join");
        info!("User {} joined document {} on {}", principal.username, doc_id, session.conn_id);
    }

    pub async fn leave_document(&self, session: &mut Session, doc_id: Option<&str>) {
        if session.principal.is_none() {
            self.send(session, ServerMessage::error(ErrorCode::NotAuthenticated, "Not authenticated"));
            return;
        }
        let Some(doc_id) = doc_id.filter(|id| !id.is_empty()) else {
            self.send(session, ServerMessage::error(ErrorCode::DocumentIdRequired, "Document ID required"));
            return;
        };
        if session.current_document() != Some(doc_id) {
            self.send(session, ServerMessage::error(ErrorCode::NotInDocument, "Not in document"));
            return;
        }

        self.leave_room(session, doc_id).await;
        self.send(
            session,
            ServerMessage::DocumentLeft(DocumentLeftMessage {
                document_id: doc_id.to_string(),
            }),
        );
        self.metrics.document_op("leave");
    }

    /// Write access is checked on every call since grants can change after joining.
    pub async fn apply_update(&self, session: &mut Session, doc_id: Option<&str>, update: Option<&[u8]>) {
        let Some(principal) = session.principal.clone() else {
            self.send(session, ServerMessage::error(ErrorCode::NotAuthenticated, "Not authenticated"));
            return;
        };
        let Some(doc_id) = doc_id.filter(|id| !id.is_empty()) else {
            self.send(session, ServerMessage::error(ErrorCode::DocumentIdRequired, "Document ID required"));
            return;
        };
        let Some(update) = update.filter(|bytes| !bytes.is_empty()) else {
            self.send(session, ServerMessage::error(ErrorCode::InvalidUpdateData, "Invalid update data"));
            return;
        };
        if session.current_document() != Some(doc_id) {
            self.send(session, ServerMessage::error(ErrorCode::NotInDocument, "Not in document"));
            return;
        }
        if !self.engine.has_write_access(doc_id, &principal.user_id).await {
            self.send(
                session,
                ServerMessage::error(ErrorCode::InsufficientPermissions, "Insufficient permissions"),
            );
            return;
        }

        match self
            .engine
            .apply_update(doc_id, &principal.user_id, update, Some(&session.conn_id))
            .await
        {
            Ok(envelope) => {
                self.send(
                    session,
                    ServerMessage::DocumentUpdateSuccess(UpdateSuccessMessage {
                        document_id: doc_id.to_string(),
                        timestamp: envelope.timestamp,
                    }),
                );
            }
            Err(SyncError::AccessDenied(_)) => {
                self.send(
                    session,
                    ServerMessage::error(ErrorCode::InsufficientPermissions, "Insufficient permissions"),
                );
            }
            Err(SyncError::InvalidUpdate(reason)) => {
                debug!("Rejected update from {} on {}: {}", session.conn_id, doc_id, reason);
                self.send(session, ServerMessage::error(ErrorCode::InvalidUpdateData, "Invalid update data"));
            }
            Err(SyncError::NotFound(_)) => {
                self.send(session, ServerMessage::error(ErrorCode::DocumentNotFound, "Document not found"));
            }
            Err(e) => {
                error!("Update from {} on {} failed: {}", session.conn_id, doc_id, e);
                self.send(session, ServerMessage::error(ErrorCode::UpdateFailed, "Failed to apply update"));
            }
        }
    }

    /// Best effort and instance-local. Anything not addressed to the caller's current
    /// room is dropped without a reply.
    pub fn cursor_update(&self, session: &Session, doc_id: Option<&str>, cursor: serde_json::Value) {
        let Some(principal) = session.principal.as_ref() else {
            return;
        };
        let (Some(doc_id), Some(current)) = (doc_id, session.current_document()) else {
            return;
        };
        if doc_id != current {
            return;
        }

        let message = ServerMessage::CursorUpdate(ServerCursorMessage {
            user_id: principal.user_id.clone(),
            username: principal.username.clone(),
            cursor,
            timestamp: Utc::now().timestamp_millis(),
        });
        self.outbox
            .broadcast(&self.registry.room_connections(doc_id), Some(&session.conn_id), &message);
    }

    /// Tear down a session. Safe to call more than once.
    pub async fn disconnect(&self, session: &mut Session, reason: &str) {
        if session.is_closed() {
            return;
        }
        session.cancel_deadline();

        if let Some(doc_id) = session.current_document().map(str::to_string) {
            self.leave_room(session, &doc_id).await;
        }
        self.subscriptions.cleanup_connection(&session.conn_id).await;
        self.registry.remove_connection(&session.conn_id);
        self.outbox.unregister(&session.conn_id);

        let duration = session.opened.elapsed();
        self.metrics.connection_closed(duration);
        session.state = SessionState::Closed;
        info!("Connection {} closed after {:?}: {}", session.conn_id, duration, reason);
    }

    /// Force-close every session of a user. Returns the number of sessions signalled.
    pub fn disconnect_user(&self, user_id: &str, reason: &str) -> usize {
        let connections = self.registry.list_user_connections(user_id);
        let closed = connections
            .iter()
            .filter(|conn_id| self.outbox.close(conn_id, FORCED_CLOSE, reason))
            .count();
        info!("Force-closing {} sessions of user {}: {}", closed, user_id, reason);
        closed
    }

    /// Evict every local connection from a document's room, telling each why. The
    /// sockets stay open; a session still pointing at the room gets DOCUMENT_NOT_FOUND
    /// on its next update.
    pub async fn close_document(&self, doc_id: &str, reason: &str) -> usize {
        let members = self.registry.room_connections(doc_id);
        for conn_id in &members {
            self.outbox
                .send(conn_id, ServerMessage::error(ErrorCode::DocumentNotFound, reason));
            self.registry.leave_document(conn_id, doc_id);
            self.subscriptions.unsubscribe(doc_id, conn_id).await;
        }
        members.len()
    }

    async fn leave_room(&self, session: &mut Session, doc_id: &str) {
        self.registry.leave_document(&session.conn_id, doc_id);
        self.subscriptions.unsubscribe(doc_id, &session.conn_id).await;
        session.state = SessionState::Authenticated;

        if let Some(principal) = session.principal.as_ref() {
            // Other tabs of the same user keep them present
            if !self.user_in_room(doc_id, &principal.user_id) {
                let left = ServerMessage::UserLeft(UserLeftMessage {
                    user_id: principal.user_id.clone(),
                    username: principal.username.clone(),
                });
                self.outbox.broadcast(&self.registry.room_connections(doc_id), None, &left);
            }
            info!("User {} left document {} on {}", principal.username, doc_id, session.conn_id);
        }
    }

    fn user_in_room(&self, doc_id: &str, user_id: &str) -> bool {
        self.registry
            .list_document_members(doc_id)
            .iter()
            .any(|member| member.user_id == user_id)
    }

    fn start_deadline(&self, session: &mut Session) {
        let outbox = self.outbox.clone();
        let authenticated = session.authenticated.clone();
        let conn_id = session.conn_id.clone();
        let timeout = self.auth_timeout;
        let started = Instant::now();

        session.deadline = Some(tokio::spawn(async move {
            for at in [timeout / 2, timeout * 5 / 6] {
                tokio::time::sleep_until(started + at).await;
                if authenticated.load(Ordering::SeqCst) {
                    return;
                }
                let remaining = (timeout - at).as_secs();
                outbox.send(
                    &conn_id,
                    ServerMessage::AuthWarning(AuthWarningMessage {
                        message: format!("Authenticate within {} seconds or the connection will be closed", remaining),
                        remaining_time: remaining,
                    }),
                );
            }

            tokio::time::sleep_until(started + timeout).await;
            if authenticated.load(Ordering::SeqCst) {
                return;
            }
            warn!("Connection {} did not authenticate within {:?}", conn_id, timeout);
            outbox.send(&conn_id, ServerMessage::auth_error(ErrorCode::AuthTimeout, "Authentication timeout"));
            outbox.close(&conn_id, AUTH_TIMEOUT_CLOSE, "Authentication timeout");
        }));
    }

    fn send(&self, session: &Session, message: ServerMessage) {
        self.outbox.send(&session.conn_id, message);
    }
}

fn auth_failure_message(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::TokenRequired => "Authentication token required",
        _ => "Authentication failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::lorodoc::{text_of, text_update};
    use crate::models::CollaboratorPermission;
    use crate::pubsub::{doc_topic, MemoryBroker};
    use crate::store::MemoryCacheStore;
    use crate::testutil::{encode_update, settle, TestStack};
    use serde_json::json;

    fn error_code(message: &ServerMessage) -> Option<ErrorCode> {
        match message {
            ServerMessage::Error(e) | ServerMessage::AuthError(e) => Some(e.code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn authenticate_message_moves_session_to_authenticated() {
        let stack = TestStack::new().await;
        let mut client = stack.connect_anonymous().await;
        assert_eq!(client.session.state(), &SessionState::AuthPending);

        client.send(&stack, json!({"type": "authenticate"})).await;
        assert_eq!(error_code(&client.next_message().await), Some(ErrorCode::TokenRequired));

        client.send(&stack, json!({"type": "authenticate", "token": "nope"})).await;
        assert_eq!(error_code(&client.next_message().await), Some(ErrorCode::AuthFailed));
        assert_eq!(client.session.state(), &SessionState::AuthPending);

        client.send(&stack, json!({"type": "authenticate", "token": TestStack::token("alice")})).await;
        match client.next_message().await {
            ServerMessage::Authenticated(msg) => {
                assert_eq!(msg.user_id, "alice");
                assert!(msg.permissions.contains(&crate::models::Permission::Write));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(client.session.state(), &SessionState::Authenticated);
        assert_eq!(stack.registry.stats().total_connections, 1);
    }

    #[tokio::test]
    async fn handshake_token_authenticates_on_open() {
        let stack = TestStack::new().await;
        let client = stack.connect("alice").await;
        assert_eq!(client.session.state(), &SessionState::Authenticated);
        assert_eq!(stack.registry.list_user_connections("alice"), vec![client.conn_id.clone()]);
    }

    #[tokio::test]
    async fn unauthenticated_calls_are_rejected() {
        let stack = TestStack::new().await;
        let mut client = stack.connect_anonymous().await;

        client.send(&stack, json!({"type": "join-document", "documentId": "d1"})).await;
        assert_eq!(error_code(&client.next_message().await), Some(ErrorCode::NotAuthenticated));

        client.send(&stack, json!({"type": "cursor-update", "documentId": "d1", "cursor": {"x": 1}})).await;
        client.assert_silent().await;

        client.send_raw(&stack, "{not json").await;
        assert_eq!(error_code(&client.next_message().await), Some(ErrorCode::InvalidMessage));
        assert!(!client.session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn auth_deadline_warns_then_closes() {
        let stack = TestStack::with_auth_timeout(Duration::from_secs(30)).await;
        let mut client = stack.connect_anonymous().await;

        tokio::time::advance(Duration::from_secs(15)).await;
        settle().await;
        match client.try_next() {
            Some(Outbound::Message(ServerMessage::AuthWarning(w))) => assert_eq!(w.remaining_time, 15),
            other => panic!("unexpected {:?}", other),
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        match client.try_next() {
            Some(Outbound::Message(ServerMessage::AuthWarning(w))) => assert_eq!(w.remaining_time, 5),
            other => panic!("unexpected {:?}", other),
        }

        tokio::time::advance(Duration::from_millis(4_999)).await;
        settle().await;
        assert!(client.try_next().is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        match client.try_next() {
            Some(Outbound::Message(msg)) => assert_eq!(error_code(&msg), Some(ErrorCode::AuthTimeout)),
            other => panic!("unexpected {:?}", other),
        }
        match client.try_next() {
            Some(Outbound::Close { code, .. }) => assert_eq!(code, AUTH_TIMEOUT_CLOSE),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn authenticating_just_before_deadline_keeps_connection() {
        let stack = TestStack::with_auth_timeout(Duration::from_secs(30)).await;
        let mut client = stack.connect_anonymous().await;

        tokio::time::advance(Duration::from_millis(29_999)).await;
        settle().await;
        client.drain();

        client.send(&stack, json!({"type": "authenticate", "token": TestStack::token("alice")})).await;
        assert!(matches!(client.try_next(), Some(Outbound::Message(ServerMessage::Authenticated(_)))));

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert!(client.try_next().is_none());
        assert_eq!(client.session.state(), &SessionState::Authenticated);
    }

    #[tokio::test]
    async fn private_document_access_flow() {
        let stack = TestStack::new().await;
        let mut alice = stack.connect("alice").await;
        let mut bob = stack.connect("bob").await;
        let doc = stack.engine.create_document("alice", "Secret", false).await.unwrap();

        bob.send(&stack, json!({"type": "join-document", "documentId": doc.id})).await;
        assert_eq!(error_code(&bob.next_message().await), Some(ErrorCode::AccessDenied));
        assert_eq!(bob.session.state(), &SessionState::Authenticated);

        alice.send(&stack, json!({"type": "join-document", "documentId": doc.id})).await;
        assert!(matches!(alice.next_message().await, ServerMessage::DocumentJoined(_)));

        stack
            .engine
            .add_collaborator(&doc.id, "bob", CollaboratorPermission::Read)
            .await
            .unwrap();
        bob.send(&stack, json!({"type": "join-document", "documentId": doc.id})).await;
        match bob.next_message().await {
            ServerMessage::DocumentJoined(joined) => {
                assert!(!joined.has_write_access);
                assert_eq!(joined.users.len(), 1);
                assert_eq!(joined.users[0].user_id, "alice");
            }
            other => panic!("unexpected {:?}", other),
        }
        match alice.next_message().await {
            ServerMessage::UserJoined(member) => assert_eq!(member.user_id, "bob"),
            other => panic!("unexpected {:?}", other),
        }

        bob.send(&stack, json!({"type": "document-update", "documentId": doc.id, "update": encode_update(&text_update(7, "x"))}))
            .await;
        assert_eq!(error_code(&bob.next_message().await), Some(ErrorCode::InsufficientPermissions));
        alice.assert_silent().await;
    }

    #[tokio::test]
    async fn updates_reach_peers_without_echo() {
        let stack = TestStack::new().await;
        let doc = stack.engine.create_document("root", "Public", true).await.unwrap();
        stack.engine.add_collaborator(&doc.id, "alice", CollaboratorPermission::Write).await.unwrap();
        stack.engine.add_collaborator(&doc.id, "bob", CollaboratorPermission::Write).await.unwrap();

        let mut alice = stack.connect("alice").await;
        let mut bob = stack.connect("bob").await;
        alice.join(&stack, &doc.id).await;
        bob.join(&stack, &doc.id).await;
        alice.drain();

        let u1 = text_update(1, "one");
        alice.send(&stack, json!({"type": "document-update", "documentId": doc.id, "update": encode_update(&u1)})).await;
        assert!(matches!(alice.next_message().await, ServerMessage::DocumentUpdateSuccess(_)));
        match bob.next_message().await {
            ServerMessage::DocumentUpdate(msg) => {
                assert_eq!(msg.update, u1);
                assert_eq!(msg.user_id, "alice");
            }
            other => panic!("unexpected {:?}", other),
        }

        let u2 = text_update(2, "two");
        bob.send(&stack, json!({"type": "document-update", "documentId": doc.id, "update": encode_update(&u2)})).await;
        assert!(matches!(bob.next_message().await, ServerMessage::DocumentUpdateSuccess(_)));
        match alice.next_message().await {
            ServerMessage::DocumentUpdate(msg) => assert_eq!(msg.update, u2),
            other => panic!("unexpected {:?}", other),
        }
        alice.assert_silent().await;
        bob.assert_silent().await;

        let text = text_of(&stack.engine.get_snapshot(&doc.id).await.unwrap());
        assert_eq!(text.len(), "onetwo".len());
    }

    #[tokio::test]
    async fn update_outside_joined_document_is_rejected() {
        let stack = TestStack::new().await;
        let doc = stack.engine.create_document("alice", "Doc", false).await.unwrap();
        let mut alice = stack.connect("alice").await;

        alice.send(&stack, json!({"type": "document-update", "documentId": doc.id, "update": encode_update(&text_update(1, "a"))}))
            .await;
        assert_eq!(error_code(&alice.next_message().await), Some(ErrorCode::NotInDocument));

        alice.join(&stack, &doc.id).await;
        alice.send(&stack, json!({"type": "document-update", "documentId": doc.id})).await;
        assert_eq!(error_code(&alice.next_message().await), Some(ErrorCode::InvalidUpdateData));

        alice.send(&stack, json!({"type": "document-update", "documentId": doc.id, "update": "!!"})).await;
        assert_eq!(error_code(&alice.next_message().await), Some(ErrorCode::InvalidUpdateData));

        alice.send(&stack, json!({"type": "document-update", "documentId": doc.id, "update": "3q2+7w=="})).await;
        assert_eq!(error_code(&alice.next_message().await), Some(ErrorCode::InvalidUpdateData));

        alice.send(&stack, json!({"type": "join-document"})).await;
        assert_eq!(error_code(&alice.next_message().await), Some(ErrorCode::DocumentIdRequired));

        alice.send(&stack, json!({"type": "join-document", "documentId": "missing"})).await;
        assert_eq!(error_code(&alice.next_message().await), Some(ErrorCode::DocumentNotFound));
    }

    #[tokio::test]
    async fn joining_another_document_leaves_the_first() {
        let stack = TestStack::new().await;
        let a = stack.engine.create_document("alice", "A", true).await.unwrap();
        let b = stack.engine.create_document("alice", "B", true).await.unwrap();
        let mut alice = stack.connect("alice").await;
        let mut bob = stack.connect("bob").await;
        bob.join(&stack, &a.id).await;
        alice.join(&stack, &a.id).await;
        bob.drain();

        alice.join(&stack, &b.id).await;
        match bob.next_message().await {
            ServerMessage::UserLeft(left) => assert_eq!(left.user_id, "alice"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(stack.registry.room_connections(&a.id), vec![bob.conn_id.clone()]);
        assert_eq!(stack.registry.current_document(&alice.conn_id), Some(b.id.clone()));
        assert_eq!(stack.subscriptions.interest_count(&a.id).await, 1);
    }

    #[tokio::test]
    async fn leave_acknowledges_and_notifies_room() {
        let stack = TestStack::new().await;
        let doc = stack.engine.create_document("alice", "Doc", true).await.unwrap();
        let mut alice = stack.connect("alice").await;
        let mut bob = stack.connect("bob").await;
        alice.join(&stack, &doc.id).await;
        bob.join(&stack, &doc.id).await;
        alice.drain();

        alice.send(&stack, json!({"type": "leave-document", "documentId": "other"})).await;
        assert_eq!(error_code(&alice.next_message().await), Some(ErrorCode::NotInDocument));

        bob.send(&stack, json!({"type": "leave-document", "documentId": doc.id})).await;
        assert!(matches!(bob.next_message().await, ServerMessage::DocumentLeft(_)));
        assert_eq!(bob.session.state(), &SessionState::Authenticated);
        assert!(matches!(alice.next_message().await, ServerMessage::UserLeft(_)));
    }

    #[tokio::test]
    async fn cursor_updates_fan_out_locally() {
        let stack = TestStack::new().await;
        let doc = stack.engine.create_document("alice", "Doc", true).await.unwrap();
        let mut alice = stack.connect("alice").await;
        let mut bob = stack.connect("bob").await;
        alice.join(&stack, &doc.id).await;
        bob.join(&stack, &doc.id).await;
        alice.drain();

        bob.send(&stack, json!({"type": "cursor-update", "documentId": doc.id, "cursor": {"pos": 4}})).await;
        match alice.next_message().await {
            ServerMessage::CursorUpdate(cursor) => {
                assert_eq!(cursor.user_id, "bob");
                assert_eq!(cursor.cursor, json!({"pos": 4}));
            }
            other => panic!("unexpected {:?}", other),
        }
        bob.assert_silent().await;

        // Wrong room is dropped silently
        bob.send(&stack, json!({"type": "cursor-update", "documentId": "elsewhere", "cursor": {}})).await;
        alice.assert_silent().await;
        bob.assert_silent().await;
    }

    #[tokio::test]
    async fn unclean_disconnect_cleans_up_room_and_broker_subscription() {
        let stack = TestStack::new().await;
        let doc = stack.engine.create_document("alice", "Doc", false).await.unwrap();
        let mut alice = stack.connect("alice").await;
        alice.join(&stack, &doc.id).await;
        assert!(stack.bridge.is_subscribed(&doc_topic(&doc.id)));

        alice.disconnect(&stack).await;
        assert!(stack.registry.room_connections(&doc.id).is_empty());
        assert_eq!(stack.subscriptions.interest_count(&doc.id).await, 0);
        assert!(!stack.subscriptions.is_subscribed(&doc.id));
        assert!(!stack.bridge.is_subscribed(&doc_topic(&doc.id)));
        assert_eq!(stack.registry.stats().total_connections, 0);
        assert_eq!(stack.metrics.snapshot().active_connections, 0);

        // Second disconnect is a no-op
        alice.disconnect(&stack).await;
    }

    #[tokio::test]
    async fn broker_outage_keeps_local_peers_in_sync() {
        let broker = Arc::new(MemoryBroker::default());
        let stack = TestStack::on(broker.clone(), Arc::new(MemoryCacheStore::default()), Duration::from_secs(30)).await;
        let doc = stack.engine.create_document("alice", "Doc", true).await.unwrap();
        stack.engine.add_collaborator(&doc.id, "bob", CollaboratorPermission::Write).await.unwrap();

        let mut alice = stack.connect("alice").await;
        let mut bob = stack.connect("bob").await;
        alice.join(&stack, &doc.id).await;
        bob.join(&stack, &doc.id).await;
        alice.drain();

        broker.set_available(false);

        let u1 = text_update(1, "offline");
        alice.send(&stack, json!({"type": "document-update", "documentId": doc.id, "update": encode_update(&u1)})).await;
        assert!(matches!(alice.next_message().await, ServerMessage::DocumentUpdateSuccess(_)));
        match bob.next_message().await {
            ServerMessage::DocumentUpdate(msg) => assert_eq!(msg.update, u1),
            other => panic!("unexpected {:?}", other),
        }
        assert!(stack.bridge.is_fallback());

        let u2 = text_update(2, "still");
        bob.send(&stack, json!({"type": "document-update", "documentId": doc.id, "update": encode_update(&u2)})).await;
        assert!(matches!(bob.next_message().await, ServerMessage::DocumentUpdateSuccess(_)));
        match alice.next_message().await {
            ServerMessage::DocumentUpdate(msg) => assert_eq!(msg.update, u2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn updates_cross_server_instances() {
        let broker = Arc::new(MemoryBroker::default());
        let store = Arc::new(MemoryCacheStore::default());
        let east = TestStack::on(broker.clone(), store.clone(), Duration::from_secs(30)).await;
        let west = TestStack::on(broker, store, Duration::from_secs(30)).await;
        let doc = east.engine.create_document("alice", "Doc", true).await.unwrap();

        let mut alice = east.connect("alice").await;
        let mut bob = west.connect("bob").await;
        alice.join(&east, &doc.id).await;
        bob.join(&west, &doc.id).await;

        let update = text_update(1, "far");
        alice.send(&east, json!({"type": "document-update", "documentId": doc.id, "update": encode_update(&update)})).await;
        assert!(matches!(alice.next_message().await, ServerMessage::DocumentUpdateSuccess(_)));
        match bob.next_message().await {
            ServerMessage::DocumentUpdate(msg) => assert_eq!(msg.update, update),
            other => panic!("unexpected {:?}", other),
        }
        alice.assert_silent().await;
    }

    #[tokio::test]
    async fn disconnect_user_closes_every_session() {
        let stack = TestStack::new().await;
        let mut tab1 = stack.connect("alice").await;
        let mut tab2 = stack.connect("alice").await;
        let mut bob = stack.connect("bob").await;

        assert_eq!(stack.protocol.disconnect_user("alice", "Account suspended"), 2);
        for tab in [&mut tab1, &mut tab2] {
            match tab.next().await {
                Outbound::Close { code, reason } => {
                    assert_eq!(code, FORCED_CLOSE);
                    assert_eq!(reason, "Account suspended");
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        bob.assert_silent().await;
    }
}
