use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{IdentityStore, InMemoryUserDirectory, JwtIdentityStore, UserDirectory};
use crate::clients::app_service_client::AppServiceClient;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::models::UpdateEnvelope;
use crate::pubsub::{BridgeConfig, Broker, MemoryBroker, PubSubBridge, RedisBroker};
use crate::services::doc_sync_service::{DocSyncService, SyncConfig};
use crate::store::{CacheStore, MemoryCacheStore, RedisCacheStore};
use crate::ws::{ConnectionRegistry, Outbox, ProtocolHandler, SubscriptionManager};

/// Everything the HTTP and WebSocket handlers share
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
    pub bridge: Arc<PubSubBridge>,
    pub engine: Arc<DocSyncService>,
    pub registry: Arc<ConnectionRegistry>,
    pub outbox: Arc<Outbox>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub identity: Arc<dyn IdentityStore>,
    pub protocol: Arc<ProtocolHandler>,
    pub shutdown: CancellationToken,
}

/// External collaborators picked from configuration
pub struct Backends {
    pub store: Arc<dyn CacheStore>,
    pub broker: Arc<dyn Broker>,
    pub directory: Arc<dyn UserDirectory>,
}

impl Backends {
    /// Redis for store and broker when `redis_url` is set, in-process otherwise.
    /// The user directory is the app service when configured, else the users file.
    pub fn from_config(config: &Config) -> Result<Self, String> {
        let (store, broker): (Arc<dyn CacheStore>, Arc<dyn Broker>) = match &config.redis_url {
            Some(url) => {
                let client = redis::Client::open(url.as_str()).map_err(|e| format!("Invalid redis_url: {}", e))?;
                info!("Using Redis at {} for documents and pub/sub", url);
                (
                    Arc::new(RedisCacheStore::new(client.clone())),
                    Arc::new(RedisBroker::new(client)),
                )
            }
            None => {
                warn!("No redis_url configured - running single-node with in-memory store and broker");
                (Arc::new(MemoryCacheStore::default()), Arc::new(MemoryBroker::default()))
            }
        };

        let directory: Arc<dyn UserDirectory> = match (&config.app_service_url, &config.jwt_secret) {
            (Some(url), Some(secret)) => {
                info!("Resolving users through app service at {}", url);
                let client = AppServiceClient::new(url.clone(), secret.clone(), config.service_name.clone())
                    .map_err(|e| format!("Failed to build app service client: {}", e))?;
                Arc::new(client)
            }
            _ => match &config.users_file {
                Some(path) => Arc::new(InMemoryUserDirectory::from_file(path)?),
                None => {
                    warn!("No user directory configured - every authentication will fail");
                    Arc::new(InMemoryUserDirectory::new())
                }
            },
        };

        Ok(Self { store, broker, directory })
    }
}

impl AppState {
    /// Wire the components in dependency order: bridge, engine, registry and outbox,
    /// subscriptions, identity, then the protocol handler.
    pub async fn assemble(config: Config, backends: Backends) -> Self {
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::new());
        let shutdown = CancellationToken::new();

        let bridge = PubSubBridge::new(backends.broker, BridgeConfig::from_config(&config), metrics.clone());
        bridge.start().await;

        let engine = DocSyncService::new(
            backends.store,
            bridge.clone(),
            metrics.clone(),
            SyncConfig::from_config(&config),
        );
        let fallback_metrics = metrics.clone();
        engine.set_local_broadcast(Arc::new(move |envelope: &UpdateEnvelope| {
            // Local listeners already have the update; other instances will not see it
            fallback_metrics.local_only_delivery();
            debug!(
                "Update on {} at {} delivered to this instance only",
                envelope.document_id, envelope.timestamp
            );
        }));
        engine.spawn_inactivity_sweep(shutdown.clone());

        let registry = Arc::new(ConnectionRegistry::new());
        let outbox = Arc::new(Outbox::new(metrics.clone()));
        let subscriptions = Arc::new(SubscriptionManager::new(engine.clone(), registry.clone(), outbox.clone()));

        let identity: Arc<dyn IdentityStore> = Arc::new(JwtIdentityStore::new(
            config.jwt_secret.clone(),
            backends.directory,
            config.user_cache_ttl(),
            config.downstream_timeout(),
        ));

        let protocol = Arc::new(ProtocolHandler::new(
            registry.clone(),
            engine.clone(),
            subscriptions.clone(),
            outbox.clone(),
            identity.clone(),
            metrics.clone(),
            config.auth_timeout(),
        ));

        Self {
            config,
            metrics,
            bridge,
            engine,
            registry,
            outbox,
            subscriptions,
            identity,
            protocol,
            shutdown,
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.bridge.shutdown();
    }
}
