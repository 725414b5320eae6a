use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};
use utoipa::ToSchema;

use crate::models::{MemberInfo, Permission, Principal};

/// One live, authenticated transport session
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub principal: Principal,
    pub document_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.principal.has_permission(permission)
    }

    pub fn member_info(&self) -> MemberInfo {
        MemberInfo {
            user_id: self.principal.user_id.clone(),
            username: self.principal.username.clone(),
            role: self.principal.role,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_connections: usize,
    pub active_rooms: usize,
    pub distinct_users: usize,
}

#[derive(Default)]
struct Indices {
    connections: HashMap<String, Connection>,
    rooms: HashMap<String, HashSet<String>>,
    users: HashMap<String, HashSet<String>>,
}

impl Indices {
    /// Drop `conn_id` from `doc_id`'s room, removing the room once empty
    fn leave_room(&mut self, doc_id: &str, conn_id: &str) {
        if let Some(room) = self.rooms.get_mut(doc_id) {
            room.remove(conn_id);
            if room.is_empty() {
                self.rooms.remove(doc_id);
            }
        }
    }
}

/// Index of every authenticated connection, by id, by user and by document room.
///
/// All three indices live behind one lock so each mutation is seen whole; the lock is
/// never held across an await.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Indices>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated connection. Returns false, and registers nothing, when
    /// called without a principal.
    pub fn add_connection(&self, conn_id: &str, principal: Option<Principal>, connected_at: DateTime<Utc>) -> bool {
        let Some(principal) = principal else {
            warn!("Connection {} registration attempted before authentication", conn_id);
            return false;
        };

        let mut inner = self.inner.write();
        let user_id = principal.user_id.clone();
        let previous = inner.connections.insert(
            conn_id.to_string(),
            Connection {
                id: conn_id.to_string(),
                principal,
                document_id: None,
                connected_at,
            },
        );
        // Re-authentication on the same socket replaces the old identity
        if let Some(previous) = previous {
            if let Some(doc_id) = &previous.document_id {
                inner.leave_room(doc_id, conn_id);
            }
            if let Some(sessions) = inner.users.get_mut(&previous.principal.user_id) {
                sessions.remove(conn_id);
                if sessions.is_empty() {
                    inner.users.remove(&previous.principal.user_id);
                }
            }
        }
        inner.users.entry(user_id).or_default().insert(conn_id.to_string());
        debug!("Connection {} registered", conn_id);
        true
    }

    /// Remove a connection from every index. Unknown ids are a no-op.
    pub fn remove_connection(&self, conn_id: &str) -> Option<Connection> {
        let mut inner = self.inner.write();
        let conn = inner.connections.remove(conn_id)?;
        if let Some(doc_id) = &conn.document_id {
            inner.leave_room(doc_id, conn_id);
        }
        if let Some(sessions) = inner.users.get_mut(&conn.principal.user_id) {
            sessions.remove(conn_id);
            if sessions.is_empty() {
                inner.users.remove(&conn.principal.user_id);
            }
        }
        debug!("Connection {} removed", conn_id);
        Some(conn)
    }

    /// Move a connection into `doc_id`'s room, leaving its current room first.
    /// Returns the document it left, if any, wrapped in `Some`; `None` for an unknown connection.
    pub fn join_document(&self, conn_id: &str, doc_id: &str) -> Option<Option<String>> {
        let mut inner = self.inner.write();
        let previous = {
            let conn = inner.connections.get_mut(conn_id)?;
            conn.document_id.replace(doc_id.to_string())
        };
        if let Some(prev) = previous.as_deref() {
            if prev != doc_id {
                inner.leave_room(prev, conn_id);
            }
        }
        inner.rooms.entry(doc_id.to_string()).or_default().insert(conn_id.to_string());
        Some(previous.filter(|prev| prev != doc_id))
    }

    /// Leave `doc_id` only if the connection is currently in it
    pub fn leave_document(&self, conn_id: &str, doc_id: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.connections.get_mut(conn_id) {
            Some(conn) if conn.document_id.as_deref() == Some(doc_id) => conn.document_id = None,
            _ => return false,
        }
        inner.leave_room(doc_id, conn_id);
        true
    }

    pub fn get(&self, conn_id: &str) -> Option<Connection> {
        self.inner.read().connections.get(conn_id).cloned()
    }

    pub fn current_document(&self, conn_id: &str) -> Option<String> {
        self.inner
            .read()
            .connections
            .get(conn_id)
            .and_then(|conn| conn.document_id.clone())
    }

    /// Presence list for a room, one entry per user
    pub fn list_document_members(&self, doc_id: &str) -> Vec<MemberInfo> {
        let inner = self.inner.read();
        let Some(room) = inner.rooms.get(doc_id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut members: Vec<MemberInfo> = room
            .iter()
            .filter_map(|id| inner.connections.get(id))
            .filter(|conn| seen.insert(conn.principal.user_id.clone()))
            .map(Connection::member_info)
            .collect();
        members.sort_by(|a, b| a.username.cmp(&b.username));
        members
    }

    pub fn room_connections(&self, doc_id: &str) -> Vec<String> {
        self.inner
            .read()
            .rooms
            .get(doc_id)
            .map(|room| room.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn list_user_connections(&self, user_id: &str) -> Vec<String> {
        self.inner
            .read()
            .users
            .get(user_id)
            .map(|sessions| sessions.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_permission(&self, conn_id: &str, permission: Permission) -> bool {
        self.inner
            .read()
            .connections
            .get(conn_id)
            .is_some_and(|conn| conn.has_permission(permission))
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        RegistryStats {
            total_connections: inner.connections.len(),
            active_rooms: inner.rooms.len(),
            distinct_users: inner.users.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Role, User};

    fn principal(id: &str, role: Role) -> Option<Principal> {
        Some(Principal::from_user(User {
            id: id.to_string(),
            username: format!("{}-name", id),
            role,
        }))
    }

    #[test]
    fn registration_requires_a_principal() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.add_connection("c1", None, Utc::now()));
        assert_eq!(registry.stats().total_connections, 0);
        assert!(registry.join_document("c1", "d1").is_none());
    }

    #[test]
    fn a_connection_occupies_one_room_at_a_time() {
        let registry = ConnectionRegistry::new();
        registry.add_connection("c1", principal("u1", Role::Editor), Utc::now());

        assert_eq!(registry.join_document("c1", "d1"), Some(None));
        assert_eq!(registry.join_document("c1", "d2"), Some(Some("d1".to_string())));
        assert!(registry.room_connections("d1").is_empty());
        assert_eq!(registry.room_connections("d2"), vec!["c1".to_string()]);
        assert_eq!(registry.stats().active_rooms, 1);

        // Rejoining the same room is not a move
        assert_eq!(registry.join_document("c1", "d2"), Some(None));
    }

    #[test]
    fn leave_only_applies_to_current_room() {
        let registry = ConnectionRegistry::new();
        registry.add_connection("c1", principal("u1", Role::Editor), Utc::now());
        registry.join_document("c1", "d1");

        assert!(!registry.leave_document("c1", "d2"));
        assert!(registry.leave_document("c1", "d1"));
        assert!(!registry.leave_document("c1", "d1"));
        assert_eq!(registry.current_document("c1"), None);
        assert_eq!(registry.stats().active_rooms, 0);
    }

    #[test]
    fn members_are_deduplicated_by_user() {
        let registry = ConnectionRegistry::new();
        registry.add_connection("tab1", principal("u1", Role::Editor), Utc::now());
        registry.add_connection("tab2", principal("u1", Role::Editor), Utc::now());
        registry.add_connection("c3", principal("u2", Role::Viewer), Utc::now());
        for conn in ["tab1", "tab2", "c3"] {
            registry.join_document(conn, "d1");
        }

        let members = registry.list_document_members("d1");
        assert_eq!(members.len(), 2);
        assert_eq!(registry.room_connections("d1").len(), 3);
        assert_eq!(registry.list_user_connections("u1").len(), 2);

        let stats = registry.stats();
        assert_eq!(stats, RegistryStats { total_connections: 3, active_rooms: 1, distinct_users: 2 });
    }

    #[test]
    fn remove_cleans_every_index_and_is_idempotent() {
        let registry = ConnectionRegistry::new();
        registry.add_connection("c1", principal("u1", Role::Editor), Utc::now());
        registry.join_document("c1", "d1");

        let removed = registry.remove_connection("c1").unwrap();
        assert_eq!(removed.document_id.as_deref(), Some("d1"));
        assert!(registry.room_connections("d1").is_empty());
        assert!(registry.list_user_connections("u1").is_empty());
        assert!(registry.remove_connection("c1").is_none());
        assert_eq!(registry.stats(), RegistryStats { total_connections: 0, active_rooms: 0, distinct_users: 0 });
    }

    #[test]
    fn permission_checks_use_cached_principal() {
        let registry = ConnectionRegistry::new();
        registry.add_connection("c1", principal("u1", Role::Viewer), Utc::now());
        assert!(registry.has_permission("c1", Permission::Read));
        assert!(!registry.has_permission("c1", Permission::Write));
        assert!(!registry.has_permission("unknown", Permission::Read));
    }
}
