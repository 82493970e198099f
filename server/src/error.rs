//! Error types for the Firewatch server.
//!
//! Each module reports failures through its own `thiserror` enum
//! ([`AuthError`], [`StoreError`], [`PendingError`], ...). Route handlers
//! convert those into [`ServerError`], the top-level type that knows how to
//! render itself as an HTTP response.
//!
//! # Status mapping
//!
//! | Variant | Status |
//! |---------|--------|
//! | [`ServerError::BadRequest`] | 400 |
//! | [`ServerError::Unauthorized`] | 401 |
//! | [`ServerError::NotFound`] | 404 |
//! | [`ServerError::Conflict`] | 409 |
//! | [`ServerError::Unprocessable`] | 422 |
//! | [`ServerError::Internal`] | 500 |
//!
//! Per-device push failures never become a `ServerError`; they are recorded
//! in the confirmation outcome instead.

use std::error::Error;
use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::auth::AuthError;
use crate::directory::StoreError;
use crate::pending::PendingError;
use crate::session::SessionError;

/// Top-level error type for request handling.
#[derive(Debug)]
pub enum ServerError {
    /// Missing or malformed request parameters.
    BadRequest(String),

    /// Credentials were supplied but are not valid.
    Unauthorized(String),

    /// A credential was required but none was supplied, or the request body
    /// could not be understood.
    Unprocessable(String),

    /// The alarm, its owner, or the owner's subscriptions do not exist.
    NotFound(String),

    /// The request collides with existing state (duplicate subscription,
    /// alarm already owned, confirmation already in flight).
    Conflict(String),

    /// Unexpected failure in the store or runtime.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Unprocessable(msg) => write!(f, "unprocessable request: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {}

impl ServerError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::Unprocessable(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP status this error is rendered with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine readable error code included in the response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Unprocessable(_) => "unprocessable",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "unknown_error",
        }
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    fn message(&self) -> &str {
        match self {
            Self::BadRequest(msg)
            | Self::Unauthorized(msg)
            | Self::Unprocessable(msg)
            | Self::NotFound(msg)
            | Self::Conflict(msg)
            | Self::Internal(msg) => msg,
        }
    }
}

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if self.is_server_error() {
            error!(error = %self, "Request failed with server error");
        }

        // Internal details stay in the logs.
        let message = if self.is_server_error() {
            "unknown error".to_string()
        } else {
            self.message().to_string()
        };

        let body = ErrorResponse {
            error: message,
            code: self.code(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(what) => Self::Conflict(what),
            StoreError::Unavailable(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<PendingError> for ServerError {
    fn from(err: PendingError) -> Self {
        Self::Conflict(err.to_string())
    }
}

impl From<AuthError> for ServerError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingCredential(_) => Self::Unprocessable(err.to_string()),
            AuthError::InvalidPublicKey => Self::Internal(err.to_string()),
            _ => Self::Unauthorized(err.to_string()),
        }
    }
}

impl From<SessionError> for ServerError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::AtCapacity { .. } => Self::Internal(err.to_string()),
            SessionError::NotFound | SessionError::InvalidToken => {
                Self::Unauthorized(err.to_string())
            }
        }
    }
}

/// A specialized Result type for request handling.
pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CorrelationKey;

    #[test]
    fn display_includes_category() {
        assert_eq!(
            ServerError::not_found("alarm 'A9'").to_string(),
            "not found: alarm 'A9'"
        );
        assert_eq!(
            ServerError::bad_request("missing alarmId").to_string(),
            "bad request: missing alarmId"
        );
        assert_eq!(
            ServerError::internal("db down").to_string(),
            "internal server error: db down"
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ServerError::bad_request("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ServerError::unauthorized("x").status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ServerError::unprocessable("x").status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ServerError::not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(ServerError::conflict("x").status(), StatusCode::CONFLICT);
        assert_eq!(
            ServerError::internal("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn only_internal_errors_are_server_errors() {
        assert!(!ServerError::not_found("x").is_server_error());
        assert!(!ServerError::conflict("x").is_server_error());
        assert!(!ServerError::unauthorized("x").is_server_error());
        assert!(ServerError::internal("x").is_server_error());
    }

    #[test]
    fn store_errors_map_to_matching_variants() {
        let err: ServerError = StoreError::NotFound("alarm 'A1'".into()).into();
        assert!(matches!(err, ServerError::NotFound(ref m) if m == "alarm 'A1'"));

        let err: ServerError = StoreError::Conflict("endpoint".into()).into();
        assert!(matches!(err, ServerError::Conflict(_)));

        let err: ServerError = StoreError::Unavailable("lock poisoned".into()).into();
        assert!(err.is_server_error());
    }

    #[test]
    fn pending_duplicate_maps_to_conflict() {
        let err: ServerError = PendingError::Duplicate(CorrelationKey::new("A1", 7)).into();
        assert!(matches!(err, ServerError::Conflict(ref m) if m.contains("A1:7")));
    }

    #[test]
    fn missing_credential_is_unprocessable() {
        let err: ServerError = AuthError::MissingCredential("Authorization".into()).into();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let err: ServerError = AuthError::InvalidSignature.into();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn session_errors_map_to_unauthorized() {
        let err: ServerError = SessionError::NotFound.into();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        let err: ServerError = SessionError::AtCapacity { max_capacity: 1 }.into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn into_response_renders_json_body() {
        let response = ServerError::not_found("alarm 'A9'").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "alarm 'A9'");
        assert_eq!(json["code"], "not_found");
    }

    #[tokio::test]
    async fn into_response_hides_internal_details() {
        let response = ServerError::internal("connection string leaked").into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "unknown error");
        assert_eq!(json["code"], "unknown_error");
    }
}
