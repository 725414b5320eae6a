use crate::{
    auth::auth,
    models::{
        api_error, ApiError, CollaboratorRequest, CreateDocumentRequest, DeleteResponse, DocumentMetadata,
        DocumentResponse, Permission, Principal, UpdateDocumentRequest,
    },
    services::doc_sync_service::SyncError,
    state::AppState,
};
use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use tracing::{error, info, warn};

fn sync_error(e: SyncError) -> ApiError {
    match e {
        SyncError::NotFound(_) => api_error(StatusCode::NOT_FOUND, e.to_string()),
        SyncError::AccessDenied(_) => api_error(StatusCode::FORBIDDEN, e.to_string()),
        SyncError::InvalidUpdate(_) => api_error(StatusCode::BAD_REQUEST, e.to_string()),
        SyncError::Crdt(_) | SyncError::Store(_) | SyncError::CorruptMetadata(..) => {
            error!("Document operation failed: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Metadata of a document the caller owns
async fn owned_metadata(state: &AppState, principal: &Principal, doc_id: &str) -> Result<DocumentMetadata, ApiError> {
    let meta = state.engine.get_metadata(doc_id).await.map_err(sync_error)?;
    auth::ensure_document_owner(principal, &meta)?;
    Ok(meta)
}

/// Create a document owned by the caller
pub async fn create_document(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<CreateDocumentRequest>,
) -> Result<(StatusCode, Json<DocumentMetadata>), ApiError> {
    auth::ensure_permission(&principal, Permission::Write)?;

    let title = request.title.trim();
    if title.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Title must not be empty"));
    }

    let meta = state
        .engine
        .create_document(&principal.user_id, title, request.is_public)
        .await
        .map_err(sync_error)?;
    info!("User {} created document {} via API", principal.user_id, meta.id);
    Ok((StatusCode::CREATED, Json(meta)))
}

/// Metadata and current snapshot of a readable document
pub async fn get_document(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(doc_id): Path<String>,
) -> Result<Json<DocumentResponse>, ApiError> {
    let (snapshot, metadata) = state.engine.get_document(&doc_id).await.map_err(sync_error)?;
    auth::ensure_can_read(&principal, &metadata)?;
    Ok(Json(DocumentResponse { metadata, state: snapshot }))
}

pub async fn update_document(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(doc_id): Path<String>,
    Json(request): Json<UpdateDocumentRequest>,
) -> Result<Json<DocumentMetadata>, ApiError> {
    if request.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(api_error(StatusCode::BAD_REQUEST, "Title must not be empty"));
    }
    let meta = state
        .engine
        .update_metadata(
            &doc_id,
            &principal.user_id,
            request.title.map(|t| t.trim().to_string()),
            request.is_public,
        )
        .await
        .map_err(sync_error)?;
    Ok(Json(meta))
}

/// Delete a document and force everyone out of its room
pub async fn delete_document(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(doc_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    owned_metadata(&state, &principal, &doc_id).await?;

    if !state.engine.delete_document(&doc_id, &principal.user_id).await {
        warn!("Delete of document {} by {} did not go through", doc_id, principal.user_id);
        return Err(api_error(StatusCode::CONFLICT, format!("Document '{}' could not be deleted", doc_id)));
    }
    let evicted = state
        .protocol
        .close_document(&doc_id, &format!("Document {} was deleted", doc_id))
        .await;
    info!("Document {} deleted, {} connections removed from its room", doc_id, evicted);

    Ok(Json(DeleteResponse { id: doc_id, deleted: true }))
}

/// Add a collaborator or change an existing collaborator's permission
pub async fn put_collaborator(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((doc_id, user_id)): Path<(String, String)>,
    Json(request): Json<CollaboratorRequest>,
) -> Result<Json<DocumentMetadata>, ApiError> {
    owned_metadata(&state, &principal, &doc_id).await?;
    let meta = state
        .engine
        .add_collaborator(&doc_id, &user_id, request.permission)
        .await
        .map_err(sync_error)?;
    Ok(Json(meta))
}

pub async fn delete_collaborator(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((doc_id, user_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let meta = owned_metadata(&state, &principal, &doc_id).await?;
    if user_id == meta.owner_id {
        return Err(api_error(StatusCode::BAD_REQUEST, "The owner cannot be removed"));
    }
    match state.engine.remove_collaborator(&doc_id, &user_id).await.map_err(sync_error)? {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("User '{}' is not a collaborator on '{}'", user_id, doc_id),
        )),
    }
}

#[cfg(test)]
mod tests {
    use crate::models::{CollaboratorPermission, DocumentMetadata, DocumentResponse, ErrorCode, ServerMessage};
    use crate::routes::create_api_routes;
    use crate::testutil::TestStack;
    use crate::ws::Outbound;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use serde::de::DeserializeOwned;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn call(stack: &TestStack, method: Method, uri: &str, user: Option<&str>, body: Option<Value>) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", TestStack::token(user)));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = create_api_routes(stack.state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn parse<T: DeserializeOwned>(bytes: &[u8]) -> T {
        serde_json::from_slice(bytes).unwrap()
    }

    async fn create(stack: &TestStack, user: &str, is_public: bool) -> DocumentMetadata {
        let (status, body) = call(
            stack,
            Method::POST,
            "/v1/documents",
            Some(user),
            Some(json!({"title": "Plan", "isPublic": is_public})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        parse(&body)
    }

    #[tokio::test]
    async fn health_is_public_and_api_requires_a_token() {
        let stack = TestStack::new().await;
        let (status, _) = call(&stack, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&stack, Method::GET, "/ready", None, None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&stack, Method::POST, "/v1/documents", None, Some(json!({"title": "x"}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(&stack, Method::GET, "/v1/documents/whatever", Some("nobody"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_and_read_respects_visibility() {
        let stack = TestStack::new().await;
        let meta = create(&stack, "alice", false).await;
        assert_eq!(meta.owner_id, "alice");
        assert_eq!(meta.title, "Plan");

        let uri = format!("/v1/documents/{}", meta.id);
        let (status, body) = call(&stack, Method::GET, &uri, Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        let doc: DocumentResponse = parse(&body);
        assert_eq!(doc.metadata.id, meta.id);

        let (status, _) = call(&stack, Method::GET, &uri, Some("bob"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&stack, Method::GET, "/v1/documents/missing", Some("alice"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn viewers_cannot_create() {
        let stack = TestStack::new().await;
        let (status, _) = call(&stack, Method::POST, "/v1/documents", Some("carol"), Some(json!({"title": "x"}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&stack, Method::POST, "/v1/documents", Some("alice"), Some(json!({"title": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn owner_manages_collaborators() {
        let stack = TestStack::new().await;
        let meta = create(&stack, "alice", false).await;
        let uri = format!("/v1/documents/{}/collaborators/bob", meta.id);

        let (status, _) = call(&stack, Method::PUT, &uri, Some("bob"), Some(json!({"permission": "write"}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(&stack, Method::PUT, &uri, Some("alice"), Some(json!({"permission": "write"}))).await;
        assert_eq!(status, StatusCode::OK);
        let updated: DocumentMetadata = parse(&body);
        assert_eq!(updated.collaborators.get("bob"), Some(&CollaboratorPermission::Write));
        assert!(stack.engine.has_write_access(&meta.id, "bob").await);

        let (status, _) = call(&stack, Method::DELETE, &uri, Some("alice"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!stack.engine.has_read_access(&meta.id, "bob").await);

        let (status, _) = call(&stack, Method::DELETE, &uri, Some("alice"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let owner_uri = format!("/v1/documents/{}/collaborators/alice", meta.id);
        let (status, _) = call(&stack, Method::DELETE, &owner_uri, Some("alice"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn patch_changes_title_and_visibility() {
        let stack = TestStack::new().await;
        let meta = create(&stack, "alice", false).await;
        let uri = format!("/v1/documents/{}", meta.id);

        let (status, _) = call(&stack, Method::PATCH, &uri, Some("bob"), Some(json!({"isPublic": true}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(
            &stack,
            Method::PATCH,
            &uri,
            Some("alice"),
            Some(json!({"title": "Roadmap", "isPublic": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let updated: DocumentMetadata = parse(&body);
        assert_eq!(updated.title, "Roadmap");
        assert!(updated.is_public);
        assert!(stack.engine.has_read_access(&meta.id, "bob").await);
    }

    #[tokio::test]
    async fn delete_evicts_room_members() {
        let stack = TestStack::new().await;
        let meta = create(&stack, "alice", true).await;
        let mut bob = stack.connect("bob").await;
        bob.join(&stack, &meta.id).await;

        let uri = format!("/v1/documents/{}", meta.id);
        let (status, _) = call(&stack, Method::DELETE, &uri, Some("bob"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(&stack, Method::DELETE, &uri, Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        let deleted: Value = parse(&body);
        assert_eq!(deleted["deleted"], true);

        match bob.next().await {
            Outbound::Message(ServerMessage::Error(e)) => assert_eq!(e.code, ErrorCode::DocumentNotFound),
            other => panic!("unexpected {:?}", other),
        }
        assert!(stack.registry.room_connections(&meta.id).is_empty());
        assert!(!stack.subscriptions.is_subscribed(&meta.id));

        let (status, _) = call(&stack, Method::GET, &uri, Some("alice"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn diagnostics_is_admin_only() {
        let stack = TestStack::new().await;
        let _alice = stack.connect("alice").await;

        let (status, _) = call(&stack, Method::GET, "/v1/diagnostics", Some("alice"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(&stack, Method::GET, "/v1/diagnostics", Some("root"), None).await;
        assert_eq!(status, StatusCode::OK);
        let diag: Value = parse(&body);
        assert_eq!(diag["n_conn"], 1);
        assert_eq!(diag["broker_health"], "connected");
        assert_eq!(diag["metrics"]["activeConnections"], 1);
    }
}
