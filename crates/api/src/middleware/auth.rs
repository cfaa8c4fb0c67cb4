//! Admin authentication middleware and helpers.
//!
//! Provides the `AdminToken` Axum extractor that validates the shared bearer
//! token on the internal routes, plus the constant-time comparison shared
//! with webhook signature verification.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use klaxon_common::error::AppError;

use crate::state::AppState;

/// Proof that the request carried the admin bearer token.
///
/// Use as an Axum extractor on the internal routes:
/// ```ignore
/// async fn handler(_admin: AdminToken) -> impl IntoResponse {
///     // only reached with a valid ADMIN_API_TOKEN
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct AdminToken;

/// Axum `FromRequestParts` implementation for `AdminToken`.
///
/// Validates the `Authorization: Bearer <token>` header against the
/// configured admin token.
impl FromRequestParts<AppState> for AdminToken {
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let expected = state.config.admin_api_token.clone();

        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        async move {
            if let Some(auth) = auth_header
                && let Some(token) = auth.strip_prefix("Bearer ")
                && constant_time_eq(token.as_bytes(), expected.as_bytes())
            {
                return Ok(AdminToken);
            }

            Err(AppError::Auth(
                "Missing or invalid admin token. Use 'Bearer <ADMIN_API_TOKEN>'".to_string(),
            ))
        }
    }
}

/// Byte-string equality that does not short-circuit on the first mismatch.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq_matches() {
        assert!(constant_time_eq(b"secret-token", b"secret-token"));
    }

    #[test]
    fn test_constant_time_eq_rejects_mismatch() {
        assert!(!constant_time_eq(b"secret-token", b"secret-tokex"));
    }

    #[test]
    fn test_constant_time_eq_rejects_length_mismatch() {
        assert!(!constant_time_eq(b"secret", b"secret-token"));
        assert!(!constant_time_eq(b"", b"x"));
    }
}
