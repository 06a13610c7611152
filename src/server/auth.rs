//! Bearer-token authentication.
//!
//! Tokens are random, handed out once by the CLI and stored only as SHA-256
//! hex digests. WebSocket upgrades and preview pages may pass the token as
//! `?token=` because browsers cannot set headers on them.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{FromRequestParts, Query};
use axum::http::{HeaderMap, header, request::Parts};
use sha2::{Digest, Sha256};

use super::api::{ApiError, AppState};
use super::models::User;

const TOKEN_PREFIX: &str = "edv_";

/// Paths on which `?token=` is accepted in place of the header.
const QUERY_TOKEN_PATHS: [&str; 2] = ["/ws/", "/preview/"];

/// A fresh API token.
pub fn generate_token() -> String {
    format!("{}{}", TOKEN_PREFIX, uuid::Uuid::new_v4().simple())
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn query_token(parts: &Parts) -> Option<String> {
    let Query(params) = Query::<HashMap<String, String>>::try_from_uri(&parts.uri).ok()?;
    params.get("token").filter(|t| !t.is_empty()).cloned()
}

/// The authenticated user making the request.
pub struct AuthUser(pub User);

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .or_else(|| {
                let path = parts.uri.path();
                QUERY_TOKEN_PATHS
                    .iter()
                    .any(|prefix| path.starts_with(prefix))
                    .then(|| query_token(parts))
                    .flatten()
            })
            .ok_or(ApiError::Unauthorized)?;

        let hash = hash_token(&token);
        let user = state
            .db
            .call(move |db| db.find_user_by_token(&hash))
            .await?
            .ok_or(ApiError::Unauthorized)?;
        Ok(AuthUser(user))
    }
}
