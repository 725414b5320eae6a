use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, error};

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Name this service uses when minting service tokens
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// JWT secret key
    pub jwt_secret: Option<String>,

    /// Base URL of the app service holding user records
    pub app_service_url: Option<String>,

    /// JSON file seeding the in-memory user directory
    pub users_file: Option<String>,

    /// Redis URL for the broker and cache store. Single-node mode when unset.
    pub redis_url: Option<String>,

    /// Seconds a fresh connection has to authenticate
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,

    /// Seconds of inactivity after which a document is evicted from memory
    #[serde(default = "default_doc_inactivity_secs")]
    pub doc_inactivity_secs: u64,

    #[serde(default = "default_doc_sweep_interval_secs")]
    pub doc_sweep_interval_secs: u64,

    /// TTL applied to persisted documents, none means no expiry
    pub snapshot_ttl_secs: Option<u64>,

    #[serde(default = "default_broker_ping_interval_secs")]
    pub broker_ping_interval_secs: u64,

    #[serde(default = "default_broker_backoff_base_ms")]
    pub broker_backoff_base_ms: u64,

    #[serde(default = "default_broker_backoff_cap_ms")]
    pub broker_backoff_cap_ms: u64,

    /// Timeout applied to every broker and store round-trip
    #[serde(default = "default_downstream_timeout_ms")]
    pub downstream_timeout_ms: u64,

    #[serde(default = "default_user_cache_ttl_secs")]
    pub user_cache_ttl_secs: u64,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in production mode
    pub fn is_production(&self) -> bool {
        self.environment.to_lowercase() == "prod" || self.environment.to_lowercase() == "production"
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn doc_inactivity(&self) -> Duration {
        Duration::from_secs(self.doc_inactivity_secs)
    }

    pub fn doc_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.doc_sweep_interval_secs)
    }

    pub fn snapshot_ttl(&self) -> Option<Duration> {
        self.snapshot_ttl_secs.map(Duration::from_secs)
    }

    pub fn broker_ping_interval(&self) -> Duration {
        Duration::from_secs(self.broker_ping_interval_secs)
    }

    pub fn broker_backoff_base(&self) -> Duration {
        Duration::from_millis(self.broker_backoff_base_ms)
    }

    pub fn broker_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.broker_backoff_cap_ms)
    }

    pub fn downstream_timeout(&self) -> Duration {
        Duration::from_millis(self.downstream_timeout_ms)
    }

    pub fn user_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.user_cache_ttl_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            service_name: default_service_name(),
            jwt_secret: None,
            app_service_url: None,
            users_file: None,
            redis_url: None,
            auth_timeout_secs: default_auth_timeout_secs(),
            doc_inactivity_secs: default_doc_inactivity_secs(),
            doc_sweep_interval_secs: default_doc_sweep_interval_secs(),
            snapshot_ttl_secs: None,
            broker_ping_interval_secs: default_broker_ping_interval_secs(),
            broker_backoff_base_ms: default_broker_backoff_base_ms(),
            broker_backoff_cap_ms: default_broker_backoff_cap_ms(),
            downstream_timeout_ms: default_downstream_timeout_ms(),
            user_cache_ttl_secs: default_user_cache_ttl_secs(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "colabri-sync".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_auth_timeout_secs() -> u64 {
    30
}

fn default_doc_inactivity_secs() -> u64 {
    3600
}

fn default_doc_sweep_interval_secs() -> u64 {
    3600
}

fn default_broker_ping_interval_secs() -> u64 {
    15
}

fn default_broker_backoff_base_ms() -> u64 {
    250
}

fn default_broker_backoff_cap_ms() -> u64 {
    30_000
}

fn default_downstream_timeout_ms() -> u64 {
    5_000
}

fn default_user_cache_ttl_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server_address(), "0.0.0.0:3000");
        assert_eq!(config.auth_timeout(), Duration::from_secs(30));
        assert_eq!(config.broker_backoff_cap(), Duration::from_secs(30));
        assert!(!config.is_production());
        assert!(config.snapshot_ttl().is_none());
    }
}
