// =============================================================================
// Owner Authentication — X-Owner-Id header extractor
// =============================================================================
//
// Every state-changing endpoint requires an `X-Owner-Id` header equal to
// the configured owner identifier. Comparison is constant time.
//
//   - no OWNER_ID configured  -> 403 (the process is read-only)
//   - missing/mismatched header -> 401
//
// Usage as an Axum extractor:
//
//   async fn handler(OwnerGuard(owner): OwnerGuard, ...) { ... }
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::app_state::AppState;

/// Compare two byte slices in constant time. Always examines every byte so
/// early mismatches are not observable through timing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Extractor yielding the authenticated owner id.
pub struct OwnerGuard(pub String);

pub struct OwnerRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for OwnerRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for OwnerGuard {
    type Rejection = OwnerRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.owner_id.as_deref() else {
            warn!("state-changing request rejected: OWNER_ID is not configured");
            return Err(OwnerRejection {
                status: StatusCode::FORBIDDEN,
                message: "Owner identifier not configured",
            });
        };

        let supplied = parts
            .headers
            .get("x-owner-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if supplied.is_empty() || !constant_time_eq(supplied.as_bytes(), expected.as_bytes()) {
            warn!("state-changing request rejected: invalid X-Owner-Id");
            return Err(OwnerRejection {
                status: StatusCode::UNAUTHORIZED,
                message: "Missing or invalid owner identifier",
            });
        }

        Ok(OwnerGuard(supplied.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"owner-1", b"owner-1"));
    }

    #[test]
    fn constant_time_eq_different() {
        assert!(!constant_time_eq(b"owner-1", b"owner-2"));
    }

    #[test]
    fn constant_time_eq_length_mismatch() {
        assert!(!constant_time_eq(b"short", b"much-longer"));
    }

    #[test]
    fn constant_time_eq_empty() {
        assert!(constant_time_eq(b"", b""));
    }
}
