//! Request-level error taxonomy.
//!
//! Subsystems carry their own error enums; this type is what crosses the
//! HTTP boundary. Transient external failures that exhaust their retry
//! budget surface as `Unavailable`, deadline expiry as `Timeout`, caller
//! mistakes as `BadRequest`, and invariant violations as `Internal`.
//! Invariant violations fail the request, never the process.

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned to API callers.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{message}")]
    Unavailable {
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("request deadline exceeded")]
    Timeout,

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::Unavailable { .. } => "unavailable",
            GatewayError::Timeout => "timeout",
            GatewayError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        GatewayError::Unavailable {
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Wire/sharable form, used to publish errors to coalesced requests.
    pub fn to_body(&self) -> ErrorBody {
        let retry_after_ms = match self {
            GatewayError::Unavailable { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        };
        ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            retry_after_ms,
        }
    }

    /// Inverse of [`to_body`](Self::to_body) for errors received from a
    /// coalesced execution.
    pub fn from_body(body: ErrorBody) -> Self {
        match body.code.as_str() {
            "bad_request" => GatewayError::BadRequest(body.message),
            "timeout" => GatewayError::Timeout,
            "internal" => GatewayError::Internal(body.message),
            _ => GatewayError::Unavailable {
                message: body.message,
                retry_after_ms: body.retry_after_ms,
            },
        }
    }
}

/// Wire form of an error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let retry_after_ms = match &self {
            GatewayError::Unavailable { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        };
        let body = ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            retry_after_ms,
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(GatewayError::BadRequest("x".into()).code(), "bad_request");
        assert_eq!(GatewayError::unavailable("x").code(), "unavailable");
        assert_eq!(GatewayError::Timeout.code(), "timeout");
        assert_eq!(GatewayError::Internal("x".into()).code(), "internal");
    }

    #[test]
    fn statuses_match_taxonomy() {
        assert_eq!(
            GatewayError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::unavailable("x").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(GatewayError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn retry_after_is_serialized_when_present() {
        let error = GatewayError::Unavailable {
            message: "llm circuit open".into(),
            retry_after_ms: Some(30_000),
        };
        let body = ErrorBody {
            code: error.code().to_string(),
            message: error.to_string(),
            retry_after_ms: Some(30_000),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["retry_after_ms"], 30_000);
    }
}
