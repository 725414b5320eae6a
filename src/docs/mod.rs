use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use crate::metrics::MetricsSnapshot;
use crate::models::*;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Readiness, reflecting broker health
#[utoipa::path(
    get,
    path = "/api/ready",
    responses(
        (status = 200, description = "Ready, possibly degraded to local-only delivery", body = HealthResponse),
        (status = 503, description = "Broker not reachable yet", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// Create a document owned by the caller
#[utoipa::path(
    post,
    path = "/api/v1/documents",
    request_body = CreateDocumentRequest,
    responses(
        (status = 201, description = "Document created", body = DocumentMetadata),
        (status = 400, description = "Empty title", body = ErrorResponse),
        (status = 403, description = "Caller lacks write permission", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
#[allow(dead_code)]
pub async fn create_document_doc() {}

/// Metadata and snapshot of a document
#[utoipa::path(
    get,
    path = "/api/v1/documents/{doc_id}",
    params(("doc_id" = String, Path, description = "Document id")),
    responses(
        (status = 200, description = "Document found", body = DocumentResponse),
        (status = 403, description = "No read access", body = ErrorResponse),
        (status = 404, description = "Unknown document", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
#[allow(dead_code)]
pub async fn get_document_doc() {}

/// Change title or visibility
#[utoipa::path(
    patch,
    path = "/api/v1/documents/{doc_id}",
    params(("doc_id" = String, Path, description = "Document id")),
    request_body = UpdateDocumentRequest,
    responses(
        (status = 200, description = "Metadata updated", body = DocumentMetadata),
        (status = 403, description = "Caller is not the owner", body = ErrorResponse),
        (status = 404, description = "Unknown document", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
#[allow(dead_code)]
pub async fn update_document_doc() {}

/// Delete a document and evict its room
#[utoipa::path(
    delete,
    path = "/api/v1/documents/{doc_id}",
    params(("doc_id" = String, Path, description = "Document id")),
    responses(
        (status = 200, description = "Document deleted", body = DeleteResponse),
        (status = 403, description = "Caller is not the owner", body = ErrorResponse),
        (status = 404, description = "Unknown document", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
#[allow(dead_code)]
pub async fn delete_document_doc() {}

/// Add a collaborator or change their permission
#[utoipa::path(
    put,
    path = "/api/v1/documents/{doc_id}/collaborators/{user_id}",
    params(
        ("doc_id" = String, Path, description = "Document id"),
        ("user_id" = String, Path, description = "Collaborator user id")
    ),
    request_body = CollaboratorRequest,
    responses(
        (status = 200, description = "Collaborator set", body = DocumentMetadata),
        (status = 403, description = "Caller is not the owner", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
#[allow(dead_code)]
pub async fn put_collaborator_doc() {}

/// Remove a collaborator
#[utoipa::path(
    delete,
    path = "/api/v1/documents/{doc_id}/collaborators/{user_id}",
    params(
        ("doc_id" = String, Path, description = "Document id"),
        ("user_id" = String, Path, description = "Collaborator user id")
    ),
    responses(
        (status = 204, description = "Collaborator removed"),
        (status = 400, description = "The owner cannot be removed", body = ErrorResponse),
        (status = 404, description = "Not a collaborator", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
#[allow(dead_code)]
pub async fn delete_collaborator_doc() {}

/// Process diagnostics, admin only
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Current diagnostics", body = DiagnosticsResponse),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse)
    ),
    security(("bearer" = []))
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).bearer_format("JWT").build()),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        create_document_doc,
        get_document_doc,
        update_document_doc,
        delete_document_doc,
        put_collaborator_doc,
        delete_collaborator_doc,
        diagnostics_doc,
    ),
    components(
        schemas(
            HealthResponse,
            ErrorResponse,
            CreateDocumentRequest,
            UpdateDocumentRequest,
            CollaboratorRequest,
            CollaboratorPermission,
            DocumentMetadata,
            DocumentResponse,
            DeleteResponse,
            DiagnosticsResponse,
            MetricsSnapshot,
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "api", description = "API endpoints")
    )
)]
pub struct ApiDoc;
