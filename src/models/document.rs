use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use utoipa::ToSchema;

/// Permission a collaborator holds on a single document
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CollaboratorPermission {
    Read,
    Write,
    Admin,
}

impl CollaboratorPermission {
    pub fn can_write(self) -> bool {
        self >= CollaboratorPermission::Write
    }
}

impl fmt::Display for CollaboratorPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollaboratorPermission::Read => write!(f, "read"),
            CollaboratorPermission::Write => write!(f, "write"),
            CollaboratorPermission::Admin => write!(f, "admin"),
        }
    }
}

/// Document metadata persisted next to the CRDT state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub id: String,
    pub title: String,
    pub owner_id: String,
    pub collaborators: HashMap<String, CollaboratorPermission>,
    pub is_public: bool,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl DocumentMetadata {
    pub fn new(id: String, owner_id: &str, title: String, is_public: bool) -> Self {
        let now = Utc::now();
        let mut collaborators = HashMap::new();
        collaborators.insert(owner_id.to_string(), CollaboratorPermission::Admin);
        Self {
            id,
            title,
            owner_id: owner_id.to_string(),
            collaborators,
            is_public,
            version: 0,
            created_at: now,
            last_activity: now,
        }
    }

    /// Owner and public checks short-circuit before the collaborator map is consulted.
    pub fn can_read(&self, user_id: &str) -> bool {
        if self.owner_id == user_id {
            return true;
        }
        if self.is_public {
            return true;
        }
        self.collaborators.contains_key(user_id)
    }

    /// Public documents never grant write on their own.
    pub fn can_write(&self, user_id: &str) -> bool {
        if self.owner_id == user_id {
            return true;
        }
        self.collaborators
            .get(user_id)
            .is_some_and(|permission| permission.can_write())
    }
}
