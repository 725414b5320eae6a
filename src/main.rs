mod auth;
mod clients;
mod config;
mod docs;
mod handlers;
mod metrics;
mod models;
mod pubsub;
mod routes;
mod services;
mod state;
mod store;
mod ws;

#[cfg(test)]
mod testutil;

use axum::{http::HeaderValue, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use routes::create_api_routes;
use docs::ApiDoc;
use config::Config;
use state::{AppState, Backends};
use tracing::{info, error, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use std::panic;

#[tokio::main]
async fn main() {

    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "colabri_sync=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });
    if config.jwt_secret.is_none() {
        warn!("No jwt_secret configured - every authentication attempt will be refused");
    }

    let backends = match Backends::from_config(&config) {
        Ok(backends) => backends,
        Err(e) => {
            error!("Failed to set up backends: {}", e);
            return;
        }
    };
    let address = config.server_address();
    let cors = cors_layer(&config);
    let state = AppState::assemble(config, backends).await;

    // Combine all routes
    let app_routes = Router::new()
        // Mount API routes
        .nest("/api", create_api_routes(state.clone()))
        // Mount the collaboration socket
        .route("/ws", get(ws::socket::websocket_handler).with_state(state.clone()))
        // Mount Swagger UI
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors)
        // Add tracing layer
        .layer(TraceLayer::new_for_http());

    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", address, e);
            return;
        }
    };

    info!("🚀 Server running on http://{}", address);
    info!("📡 WebSocket available at ws://{}/ws", address);
    info!("📚 Swagger UI available at http://{}/swagger", address);

    let shutdown_state = state.clone();
    if let Err(e) = axum::serve(listener, app_routes)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, draining connections");
            shutdown_state.shutdown();
        })
        .await
    {
        error!("Server error: {}", e);
    }
    info!("Server stopped");
}

/// Allow the configured comma separated origins, or any origin when none are set
fn cors_layer(config: &Config) -> CorsLayer {
    let Some(origins) = config.cors_origins.as_deref() else {
        if config.is_production() {
            warn!("No cors_origins configured in production - allowing any origin");
        }
        return CorsLayer::permissive();
    };

    let origins: Vec<HeaderValue> = origins
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring invalid CORS origin '{}': {}", origin, e);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
