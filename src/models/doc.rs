use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use utoipa::ToSchema;

use crate::models::{CollaboratorPermission, DocumentMetadata};

/// Request body for creating a document
#[derive(Serialize, Deserialize, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentRequest {
    pub title: String,
    #[serde(default)]
    pub is_public: bool,
}

/// Request body for adding or updating a collaborator
#[derive(Serialize, Deserialize, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CollaboratorRequest {
    pub permission: CollaboratorPermission,
}

/// Response for a delete operation
#[derive(Serialize, Deserialize, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub id: String,
    pub deleted: bool,
}

/// Request body for changing a document's title or visibility
#[derive(Serialize, Deserialize, Debug, Default, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDocumentRequest {
    pub title: Option<String>,
    pub is_public: Option<bool>,
}

/// Document state as returned over HTTP
#[serde_as]
#[derive(Serialize, Deserialize, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentResponse {
    pub metadata: DocumentMetadata,
    /// Base64 encoded CRDT snapshot
    #[serde_as(as = "Base64")]
    #[schema(value_type = String, format = Byte)]
    pub state: Vec<u8>,
}
