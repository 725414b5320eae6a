use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::models::{ErrorCode, Principal, User};
use crate::services::auth_service::{validate_jwt, TokenClaims};

#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("Token required")]
    TokenRequired,
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    #[error("User '{0}' not found")]
    UnknownUser(String),
    #[error("User lookup failed: {0}")]
    Lookup(String),
    #[error("Authentication is not configured")]
    NotConfigured,
}

impl AuthError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::TokenRequired => ErrorCode::TokenRequired,
            _ => ErrorCode::AuthFailed,
        }
    }
}

/// Source of user records
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>, AuthError>;
}

/// Turns a bearer token into a principal
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn verify_token(&self, token: &str) -> Result<TokenClaims, AuthError>;

    async fn find_user_by_id(&self, user_id: &str) -> Result<Option<User>, AuthError>;

    async fn authenticate(&self, token: Option<&str>) -> Result<Principal, AuthError> {
        let token = token.filter(|t| !t.is_empty()).ok_or(AuthError::TokenRequired)?;
        let claims = self.verify_token(token).await?;
        let user = self
            .find_user_by_id(&claims.sub)
            .await?
            .ok_or_else(|| AuthError::UnknownUser(claims.sub.clone()))?;
        Ok(Principal::from_user(user))
    }
}

/// HS256 tokens resolved through a user directory, with users cached for a while
pub struct JwtIdentityStore {
    secret: Option<String>,
    directory: Arc<dyn UserDirectory>,
    users: Cache<String, User>,
    lookup_timeout: Duration,
}

impl JwtIdentityStore {
    pub fn new(secret: Option<String>, directory: Arc<dyn UserDirectory>, cache_ttl: Duration, lookup_timeout: Duration) -> Self {
        let users = Cache::builder()
            .max_capacity(100_000)
            .time_to_idle(cache_ttl)
            .build();
        info!("User cache initialized");
        Self {
            secret,
            directory,
            users,
            lookup_timeout,
        }
    }

    /// Forget a cached user so the next lookup hits the directory
    pub async fn invalidate(&self, user_id: &str) {
        self.users.invalidate(user_id).await;
    }
}

#[async_trait]
impl IdentityStore for JwtIdentityStore {
    async fn verify_token(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let secret = self.secret.as_deref().ok_or_else(|| {
            error!("JWT secret not configured");
            AuthError::NotConfigured
        })?;
        let data = validate_jwt(token, secret).map_err(|e| {
            debug!("JWT validation failed: {}", e);
            AuthError::InvalidToken(e.to_string())
        })?;
        if data.claims.token_type != "user" {
            return Err(AuthError::InvalidToken(format!("unexpected token type '{}'", data.claims.token_type)));
        }
        Ok(data.claims)
    }

    async fn find_user_by_id(&self, user_id: &str) -> Result<Option<User>, AuthError> {
        if let Some(user) = self.users.get(user_id).await {
            return Ok(Some(user));
        }

        debug!("User cache miss for {}", user_id);
        let found = tokio::time::timeout(self.lookup_timeout, self.directory.find_user(user_id))
            .await
            .map_err(|_| AuthError::Lookup(format!("lookup of '{}' timed out", user_id)))??;
        if let Some(user) = &found {
            self.users.insert(user_id.to_string(), user.clone()).await;
        }
        Ok(found)
    }
}
