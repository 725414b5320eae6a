use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};
use crate::auth::AuthError;
use crate::services::auth_service::get_auth_token;
use crate::state::AppState;

/// Resolve the bearer token or auth cookie to a principal and hand it to the handlers
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = match get_auth_token(req.headers()) {
        Ok(token) => token,
        Err(e) => {
            debug!("Rejecting {} {}: {}", req.method(), req.uri().path(), e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    let principal = match state.identity.authenticate(Some(&token)).await {
        Ok(principal) => principal,
        Err(AuthError::Lookup(e)) => {
            warn!("User lookup failed while authenticating request: {}", e);
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
        Err(AuthError::NotConfigured) => {
            warn!("Request rejected, authentication is not configured");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Err(e) => {
            debug!("Authentication failed: {}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    debug!("Request authenticated as {}", principal.user_id);
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}
