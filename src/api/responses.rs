//! # API Response Types
//!
//! Standardized error envelope for the control-plane API. Every error
//! carries a stable category code and a human message; stack traces and
//! internal detail never cross the appliance surface.
//!
//! Category-to-status mapping:
//!
//! - `validation` → 400
//! - `not_found` → 404
//! - `conflict` → 409
//! - `invariant_violation` → 422 for admin callers; agent callers get a
//!   retry-friendly 503 instead, so a chain under repair provokes retry
//!   rather than agent-side failure handling
//! - `upstream_unavailable` → 503

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Structured API error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Stable category code
    pub category: String,
    /// Human-readable message
    pub message: String,
    /// HTTP status (not serialized)
    #[serde(skip)]
    pub status: StatusCode,
}

impl ApiError {
    /// 400: the request is malformed or out of range
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            category: "validation".to_string(),
            message: message.into(),
            status: StatusCode::BAD_REQUEST,
        }
    }

    /// 404: the entity does not exist
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            category: "not_found".to_string(),
            message: message.into(),
            status: StatusCode::NOT_FOUND,
        }
    }

    /// 401: authentication failed
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            category: "unauthorized".to_string(),
            message: message.into(),
            status: StatusCode::UNAUTHORIZED,
        }
    }

    /// 409: the operation conflicts with current state
    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            category: "conflict".to_string(),
            message: message.into(),
            status: StatusCode::CONFLICT,
        }
    }

    /// 422: an invariant does not hold; admin surface only
    pub fn invariant(message: impl Into<String>) -> Self {
        Self {
            category: "invariant_violation".to_string(),
            message: message.into(),
            status: StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    /// 503 with the invariant category: what agents see instead of 422,
    /// provoking retry after repair
    pub fn invariant_for_agent() -> Self {
        Self {
            category: "invariant_violation".to_string(),
            message: "temporarily unavailable, retry".to_string(),
            status: StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// 503: a dependency is unavailable
    pub fn upstream(message: impl Into<String>) -> Self {
        Self {
            category: "upstream_unavailable".to_string(),
            message: message.into(),
            status: StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// 500: unexpected internal failure, detail withheld
    pub fn internal() -> Self {
        Self {
            category: "internal".to_string(),
            message: "internal error".to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

/// Result alias for handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_not_serialized() {
        let err = ApiError::validation("bad framework name");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["category"], "validation");
        assert!(json.get("status").is_none());
    }

    #[test]
    fn test_agent_invariant_is_retryable() {
        let err = ApiError::invariant_for_agent();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.category, "invariant_violation");
    }
}
