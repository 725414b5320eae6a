use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Editor,
    Viewer,
}

impl Role {
    /// Permission set granted to every principal holding this role
    pub fn permissions(self) -> BTreeSet<Permission> {
        match self {
            Role::Admin => [Permission::Read, Permission::Write, Permission::Delete, Permission::Admin].into(),
            Role::Editor => [Permission::Read, Permission::Write].into(),
            Role::Viewer => [Permission::Read].into(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Editor => write!(f, "editor"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Delete,
    Admin,
}

/// User record as held by the user directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub role: Role,
}

/// Authenticated identity attached to a connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: String,
    pub username: String,
    pub role: Role,
    pub permissions: BTreeSet<Permission>,
}

impl Principal {
    pub fn from_user(user: User) -> Self {
        Self {
            permissions: user.role.permissions(),
            user_id: user.id,
            username: user.username,
            role: user.role,
        }
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}
