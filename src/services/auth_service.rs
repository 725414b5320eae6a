use axum::http::{self, HeaderMap};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Claims carried by every token this service accepts or mints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    pub sub: String,
    pub exp: usize,
    #[serde(rename = "type", default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "user".to_string()
}

// Get the auth token from request headers
pub fn get_auth_token(headers: &HeaderMap) -> Result<String, String> {
    // 1. Try to get token from Authorization header
    if let Some(auth_header) = headers.get(http::header::AUTHORIZATION) {
        let auth_str = auth_header.to_str().map_err(|_| "Invalid Authorization header".to_string())?;
        Ok(auth_str
            .strip_prefix("Bearer ")
            .unwrap_or(auth_str)
            .to_string())
    }
    // 2. Try to get token from cookies
    else {
        let cookie_header = headers.get(http::header::COOKIE)
            .ok_or_else(|| "Missing Authorization header or Cookie".to_string())?
            .to_str()
            .map_err(|_| "Invalid Cookie header".to_string())?;

        for c in cookie::Cookie::split_parse(cookie_header).flatten() {
            if c.name() == "auth_token" {
                return Ok(c.value().to_string());
            }
        }
        Err("auth_token cookie not found".to_string())
    }
}

// Handshake credentials: the query token wins over headers and cookies
pub fn get_handshake_token(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
    query_token
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .or_else(|| get_auth_token(headers).ok())
        .filter(|token| !token.is_empty())
}

// Validate a JWT token and return the token data
pub fn validate_jwt(token: &str, secret: &str) -> Result<TokenData<TokenClaims>, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    decode::<TokenClaims>(token, &decoding_key, &validation)
}

// Mint an HS256 token for `sub`, valid for `ttl`
pub fn issue_jwt(sub: &str, token_type: &str, secret: &str, ttl: Duration) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = TokenClaims {
        sub: sub.to_string(),
        exp: (Utc::now().timestamp() as u64 + ttl.as_secs()) as usize,
        token_type: token_type.to_string(),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn token_from_bearer_header_or_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(get_auth_token(&headers).unwrap(), "abc");

        let mut headers = HeaderMap::new();
        headers.insert(http::header::COOKIE, HeaderValue::from_static("theme=dark; auth_token=xyz"));
        assert_eq!(get_auth_token(&headers).unwrap(), "xyz");

        assert!(get_auth_token(&HeaderMap::new()).is_err());
    }

    #[test]
    fn query_token_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Bearer header"));
        assert_eq!(get_handshake_token(Some("query"), &headers).as_deref(), Some("query"));
        assert_eq!(get_handshake_token(Some(""), &headers).as_deref(), Some("header"));
        assert_eq!(get_handshake_token(None, &HeaderMap::new()), None);
    }

    #[test]
    fn issued_tokens_validate_with_same_secret_only() {
        let token = issue_jwt("u1", "user", "secret", Duration::from_secs(60)).unwrap();
        let data = validate_jwt(&token, "secret").unwrap();
        assert_eq!(data.claims.sub, "u1");
        assert!(validate_jwt(&token, "other").is_err());
    }
}
