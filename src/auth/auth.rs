use axum::{http::StatusCode, Json};
use crate::models::{DocumentMetadata, ErrorResponse, Permission, Principal};

pub fn is_admin(principal: &Principal) -> bool {
    principal.has_permission(Permission::Admin)
}

pub fn is_document_owner(principal: &Principal, meta: &DocumentMetadata) -> bool {
    meta.owner_id == principal.user_id
}

pub fn ensure_permission(principal: &Principal, permission: Permission) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if principal.has_permission(permission) {
        return Ok(());
    }

    let status = StatusCode::FORBIDDEN;
    Err((status, Json(ErrorResponse {
        code: status.as_u16(),
        status: status.to_string(),
        error: format!("Permission '{:?}' required", permission).to_lowercase(),
    })))
}

pub fn ensure_admin(principal: &Principal) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if is_admin(principal) {
        return Ok(());
    }

    let status = StatusCode::FORBIDDEN;
    Err((status, Json(ErrorResponse {
        code: status.as_u16(),
        status: status.to_string(),
        error: "Admin access required".to_string(),
    })))
}

pub fn ensure_document_owner(principal: &Principal, meta: &DocumentMetadata) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if is_document_owner(principal, meta) {
        return Ok(());
    }

    let status = StatusCode::FORBIDDEN;
    Err((status, Json(ErrorResponse {
        code: status.as_u16(),
        status: status.to_string(),
        error: format!("Only the owner may manage document '{}'", meta.id),
    })))
}

pub fn ensure_can_read(principal: &Principal, meta: &DocumentMetadata) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if meta.can_read(&principal.user_id) {
        return Ok(());
    }

    let status = StatusCode::FORBIDDEN;
    Err((status, Json(ErrorResponse {
        code: status.as_u16(),
        status: status.to_string(),
        error: "Access denied".to_string(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Role, User};

    fn principal(id: &str, role: Role) -> Principal {
        Principal::from_user(User {
            id: id.to_string(),
            username: id.to_string(),
            role,
        })
    }

    #[test]
    fn guards() {
        let meta = DocumentMetadata::new("d1".to_string(), "owner", "T".to_string(), false);
        assert!(ensure_document_owner(&principal("owner", Role::Viewer), &meta).is_ok());
        assert!(ensure_document_owner(&principal("other", Role::Admin), &meta).is_err());
        assert!(ensure_can_read(&principal("other", Role::Admin), &meta).is_err());
        assert!(ensure_admin(&principal("root", Role::Admin)).is_ok());

        let (status, body) = ensure_permission(&principal("v", Role::Viewer), Permission::Write).unwrap_err();
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body.error, "permission 'write' required");
    }
}
