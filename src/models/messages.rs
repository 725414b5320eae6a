use serde::{Deserialize, Serialize};
use serde_with::{serde_as, base64::Base64};
use std::collections::BTreeSet;
use std::fmt;

use crate::models::{DocumentMetadata, Permission, Role};

/// Machine-readable error codes carried by `auth-error` and `error` events
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TokenRequired,
    AuthFailed,
    AuthTimeout,
    NotAuthenticated,
    DocumentIdRequired,
    DocumentNotFound,
    AccessDenied,
    JoinFailed,
    NotInDocument,
    InsufficientPermissions,
    InvalidUpdateData,
    UpdateFailed,
    InvalidMessage,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::TokenRequired => "TOKEN_REQUIRED",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::AuthTimeout => "AUTH_TIMEOUT",
            ErrorCode::NotAuthenticated => "NOT_AUTHENTICATED",
            ErrorCode::DocumentIdRequired => "DOCUMENT_ID_REQUIRED",
            ErrorCode::DocumentNotFound => "DOCUMENT_NOT_FOUND",
            ErrorCode::AccessDenied => "ACCESS_DENIED",
            ErrorCode::JoinFailed => "JOIN_FAILED",
            ErrorCode::NotInDocument => "NOT_IN_DOCUMENT",
            ErrorCode::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            ErrorCode::InvalidUpdateData => "INVALID_UPDATE_DATA",
            ErrorCode::UpdateFailed => "UPDATE_FAILED",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Client -> server

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateMessage {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRefMessage {
    #[serde(default)]
    pub document_id: Option<String>,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientUpdateMessage {
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde_as(as = "Option<Base64>")]
    pub update: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientCursorMessage {
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub cursor: serde_json::Value,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Authenticate(AuthenticateMessage),
    JoinDocument(DocumentRefMessage),
    LeaveDocument(DocumentRefMessage),
    DocumentUpdate(ClientUpdateMessage),
    CursorUpdate(ClientCursorMessage),
}

impl ClientMessage {
    /// Event name used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Authenticate(_) => "authenticate",
            ClientMessage::JoinDocument(_) => "join-document",
            ClientMessage::LeaveDocument(_) => "leave-document",
            ClientMessage::DocumentUpdate(_) => "document-update",
            ClientMessage::CursorUpdate(_) => "cursor-update",
        }
    }

    /// Parse a text frame. A malformed `document-update` is reported as invalid update
    /// data, anything else as an invalid message.
    pub fn parse(text: &str) -> Result<Self, (ErrorCode, String)> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => Ok(msg),
            Err(e) => {
                let kind = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string));
                if kind.as_deref() == Some("document-update") {
                    Err((ErrorCode::InvalidUpdateData, format!("Invalid update data: {}", e)))
                } else {
                    Err((ErrorCode::InvalidMessage, format!("Invalid message: {}", e)))
                }
            }
        }
    }
}

// Server -> client

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedMessage {
    pub user_id: String,
    pub username: String,
    pub role: Role,
    pub permissions: BTreeSet<Permission>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub message: String,
    pub code: ErrorCode,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthWarningMessage {
    pub message: String,
    /// Seconds left before the connection is closed
    pub remaining_time: u64,
}

/// Presence entry, one per user in a room
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub user_id: String,
    pub username: String,
    pub role: Role,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentJoinedMessage {
    pub document_id: String,
    pub users: Vec<MemberInfo>,
    #[serde_as(as = "Base64")]
    pub document_state: Vec<u8>,
    pub metadata: DocumentMetadata,
    pub has_write_access: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentLeftMessage {
    pub document_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserLeftMessage {
    pub user_id: String,
    pub username: String,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerUpdateMessage {
    pub document_id: String,
    #[serde_as(as = "Base64")]
    pub update: Vec<u8>,
    pub user_id: String,
    pub timestamp: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSuccessMessage {
    pub document_id: String,
    pub timestamp: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerCursorMessage {
    pub user_id: String,
    pub username: String,
    pub cursor: serde_json::Value,
    pub timestamp: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Authenticated(AuthenticatedMessage),
    AuthError(ErrorMessage),
    AuthWarning(AuthWarningMessage),
    DocumentJoined(DocumentJoinedMessage),
    DocumentLeft(DocumentLeftMessage),
    UserJoined(MemberInfo),
    UserLeft(UserLeftMessage),
    DocumentUpdate(ServerUpdateMessage),
    DocumentUpdateSuccess(UpdateSuccessMessage),
    CursorUpdate(ServerCursorMessage),
    Error(ErrorMessage),
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorMessage { message: message.into(), code })
    }

    pub fn auth_error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::AuthError(ErrorMessage { message: message.into(), code })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Authenticated(_) => "authenticated",
            ServerMessage::AuthError(_) => "auth-error",
            ServerMessage::AuthWarning(_) => "auth-warning",
            ServerMessage::DocumentJoined(_) => "document-joined",
            ServerMessage::DocumentLeft(_) => "document-left",
            ServerMessage::UserJoined(_) => "user-joined",
            ServerMessage::UserLeft(_) => "user-left",
            ServerMessage::DocumentUpdate(_) => "document-update",
            ServerMessage::DocumentUpdateSuccess(_) => "document-update-success",
            ServerMessage::CursorUpdate(_) => "cursor-update",
            ServerMessage::Error(_) => "error",
        }
    }
}

// Broker payload

/// An applied update as it travels between server instances
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEnvelope {
    pub document_id: String,
    #[serde_as(as = "Base64")]
    pub update: Vec<u8>,
    pub user_id: String,
    pub timestamp: i64,
    pub origin_connection: Option<String>,
    pub origin_instance: String,
}

impl UpdateEnvelope {
    pub fn to_client_message(&self) -> ServerMessage {
        ServerMessage::DocumentUpdate(ServerUpdateMessage {
            document_id: self.document_id.clone(),
            update: self.update.clone(),
            user_id: self.user_id.clone(),
            timestamp: self.timestamp,
        })
    }
}

/// Metadata change relayed between instances. `None` means the document was deleted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEnvelope {
    pub document_id: String,
    pub metadata: Option<DocumentMetadata>,
    pub origin_instance: String,
}

/// Everything published on a document topic
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RelayMessage {
    Update(UpdateEnvelope),
    Metadata(MetadataEnvelope),
}

impl RelayMessage {
    pub fn document_id(&self) -> &str {
        match self {
            RelayMessage::Update(envelope) => &envelope.document_id,
            RelayMessage::Metadata(change) => &change.document_id,
        }
    }

    pub fn origin_instance(&self) -> &str {
        match self {
            RelayMessage::Update(envelope) => &envelope.origin_instance,
            RelayMessage::Metadata(change) => &change.origin_instance,
        }
    }
}
