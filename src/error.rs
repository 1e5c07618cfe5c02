//! API error taxonomy.
//!
//! Every handler returns `Result<_, ApiError>`; the `IntoResponse` impl is
//! the single place where failures become structured JSON bodies, so nothing
//! can crash the request-handling process or leak an unformatted error.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::ha::HaError;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Talking to Home Assistant failed. Never retried internally; the
    /// client owns the retry (explicit Refresh).
    #[error("Home Assistant request failed: {0}")]
    RemoteFetch(String),

    /// Entity filtered out by whitelist/blacklist. Deliberately distinct
    /// from `SessionNotFound` so filtered ids do not read as nonexistent.
    #[error("Access to this entity is not allowed")]
    EntityNotAllowed,

    /// Malformed upload: wrong archive shape, missing fields, bad JSON.
    #[error("Invalid import: {0}")]
    ImportParse(String),

    /// Unknown or already-deleted import id. A normal condition (stale tab),
    /// not a server fault.
    #[error("Unknown or expired import session")]
    SessionNotFound,

    /// Source IP is over the failed-login threshold.
    #[error("Your IP address has been banned due to too many failed login attempts")]
    Banned,

    /// Login failure. The message is generic on purpose: it must not reveal
    /// whether the username exists.
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("{0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<HaError> for ApiError {
    fn from(err: HaError) -> Self {
        ApiError::RemoteFetch(err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::RemoteFetch(_) => (StatusCode::BAD_GATEWAY, "remote_fetch", self.to_string()),
            ApiError::EntityNotAllowed => (StatusCode::FORBIDDEN, "forbidden", self.to_string()),
            ApiError::ImportParse(_) => (StatusCode::BAD_REQUEST, "import_parse", self.to_string()),
            ApiError::SessionNotFound => (StatusCode::NOT_FOUND, "not_found", self.to_string()),
            ApiError::Banned => (StatusCode::FORBIDDEN, "banned", self.to_string()),
            ApiError::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, "unauthorized", self.to_string())
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request", self.to_string()),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "An internal error occurred".to_string(),
                )
            }
        };

        (status, Json(ErrorBody { error: code, message })).into_response()
    }
}
