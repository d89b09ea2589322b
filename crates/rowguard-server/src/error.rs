//! Error types for the server crate.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rowguard_rls::{BoundaryError, RlsError};
use serde_json::json;
use thiserror::Error;

/// Errors returned by handlers and middleware.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Rejected at the tenant boundary.
    #[error(transparent)]
    Boundary(#[from] BoundaryError),

    /// Statement could not be rewritten.
    #[error(transparent)]
    Rls(#[from] RlsError),

    /// Malformed identity header.
    #[error("invalid header {header}: {reason}")]
    BadHeader { header: String, reason: String },

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn bad_header(header: &str, reason: impl Into<String>) -> Self {
        ApiError::BadHeader {
            header: header.to_string(),
            reason: reason.into(),
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Boundary(err) if err.is_forbidden() => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::Boundary(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::BadHeader { .. } => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Rls(err) => match err {
                RlsError::ParseError(_) => (StatusCode::BAD_REQUEST, "parse_error"),
                RlsError::DdlNotAllowed { .. } | RlsError::UnsupportedStatement { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "unsupported_statement")
                }
                RlsError::MissingTenant { .. } => (StatusCode::BAD_REQUEST, "missing_tenant"),
                RlsError::MissingCaller { .. } => (StatusCode::UNAUTHORIZED, "missing_caller"),
                RlsError::ScopeUnavailable { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, "scope_unavailable")
                }
                RlsError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            },
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        (
            status,
            Json(json!({ "error": code, "message": self.to_string() })),
        )
            .into_response()
    }
}
