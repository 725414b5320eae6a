use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::identity::{AuthError, UserDirectory};
use crate::models::User;

/// Users held in process, optionally seeded from a JSON file
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<String, User>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of users
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        let users: Vec<User> = serde_json::from_str(&raw)
            .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

        let directory = Self::new();
        for user in users {
            directory.insert(user);
        }
        info!("Loaded {} users from {}", directory.len(), path.display());
        Ok(directory)
    }

    pub fn insert(&self, user: User) {
        self.users.write().insert(user.id.clone(), user);
    }

    pub fn remove(&self, user_id: &str) -> Option<User> {
        self.users.write().remove(user_id)
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>, AuthError> {
        Ok(self.users.read().get(user_id).cloned())
    }
}
