//! Bearer-token authentication.
//!
//! API tokens are never stored in clear: the `api_tokens` table holds their
//! BLAKE3 digests. The service token (`ADMIN_TOKEN`) lives only in config.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use mailwave_shared::UserId;
use mailwave_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::error::ServerError;

/// The authenticated caller.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(ServerError::Unauthorized)?;
        let digest = hash_token(token);
        state
            .db
            .with(|db| db.user_for_token_hash(&digest))?
            .map(AuthUser)
            .ok_or(ServerError::Unauthorized)
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub fn hash_token(token: &str) -> String {
    blake3::hash(token.as_bytes()).to_hex().to_string()
}

/// Create a new API token for `user_id` and return it in clear. Only the
/// digest is stored.
pub fn issue_token(db: &Database, user_id: UserId) -> mailwave_store::Result<String> {
    let mut raw = Vec::with_capacity(32);
    raw.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    raw.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    let token = format!("mw_{}", hex::encode(raw));
    db.insert_api_token(&hash_token(&token), user_id)?;
    Ok(token)
}

/// Whether the request carries the configured service token.
pub fn is_admin(headers: &HeaderMap, config: &ServerConfig) -> bool {
    let (Some(expected), Some(token)) = (config.admin_token.as_deref(), bearer_token(headers))
    else {
        return false;
    };
    let token = token.as_bytes();
    let expected = expected.as_bytes();
    token.len() == expected.len() && token.ct_eq(expected).unwrap_u8() == 1
}

pub fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    if config.admin_token.is_none() {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    }
    if !is_admin(headers, config) {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }
    Ok(())
}
