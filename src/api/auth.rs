//! Bearer token check for the voice routes

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};

use super::ApiState;
use super::turn::{ApiError, USER_ID_HEADER};

/// Token from an `Authorization: Bearer <token>` header
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Compare digests, not raw keys
fn key_matches(provided: &str, expected: &str) -> bool {
    Sha256::digest(provided.as_bytes()) == Sha256::digest(expected.as_bytes())
}

/// Reject turn submissions without the configured key
///
/// Every request passes when the server has no key configured.
///
/// # Errors
///
/// Returns `Unauthorized` for a missing or wrong token
pub async fn require_bearer(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let headers = req.headers();
    match bearer_token(headers) {
        Some(token) if key_matches(token, expected) => Ok(next.run(req).await),
        provided => {
            let caller = headers
                .get(USER_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-");
            tracing::warn!(
                path = %req.uri().path(),
                caller,
                token_present = provided.is_some(),
                "turn request refused"
            );
            Err(ApiError::Unauthorized)
        }
    }
}
