use crate::{
    handlers::{
        create_document, delete_collaborator, delete_document, diagnostics, get_document, health_check,
        put_collaborator, ready_check, update_document,
    },
    routes::auth_middleware::auth_middleware,
    state::AppState,
};
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

/// Create API routes
pub fn create_api_routes(state: AppState) -> Router {
    let authenticated = Router::<AppState>::new()
        .route("/v1/diagnostics", get(diagnostics))
        .route("/v1/documents", post(create_document))
        .route(
            "/v1/documents/:doc_id",
            get(get_document).patch(update_document).delete(delete_document),
        )
        .route(
            "/v1/documents/:doc_id/collaborators/:user_id",
            put(put_collaborator).delete(delete_collaborator),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware)); // Applies to all routes added above

    Router::<AppState>::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .merge(authenticated)
        .with_state(state)
}
