use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, error};

use crate::auth::identity::{AuthError, UserDirectory};
use crate::models::User;
use crate::services::auth_service::issue_jwt;

/// User directory backed by the app service's REST API
#[derive(Debug)]
pub struct AppServiceClient {
    client: Client,
    base_url: String,
    jwt_secret: String,
    service_name: String,
}

impl AppServiceClient {
    pub fn new(base_url: String, jwt_secret: String, service_name: String) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            jwt_secret,
            service_name,
        })
    }

    fn generate_token(&self) -> Result<String, AuthError> {
        // 1 minute expiration
        issue_jwt(&self.service_name, "service", &self.jwt_secret, Duration::from_secs(60))
            .map_err(|e| AuthError::Lookup(format!("Failed to generate service token: {}", e)))
    }

    pub async fn get_user(&self, uid: &str) -> Result<Option<User>, AuthError> {
        let token = self.generate_token()?;
        let url = format!("{}/users/{}", self.base_url, uid);
        let response = self.client.get(&url)
            .bearer_auth(token)
            .send().await
            .map_err(|e| {
                error!("Failed to retrieve user {}: {}", uid, e);
                AuthError::Lookup(e.to_string())
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("App service has no user {}", uid);
            return Ok(None);
        }
        let response = response.error_for_status().map_err(|e| AuthError::Lookup(e.to_string()))?;
        let user = response.json::<User>().await.map_err(|e| AuthError::Lookup(e.to_string()))?;
        Ok(Some(user))
    }
}

#[async_trait]
impl UserDirectory for AppServiceClient {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>, AuthError> {
        self.get_user(user_id).await
    }
}
