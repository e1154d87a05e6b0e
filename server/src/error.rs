//! Error taxonomy for the federation surface.
//!
//! Store and plumbing code returns `anyhow::Result`; anything that reaches an
//! inbound federation request is converted into a [`FederationError`], which
//! knows its HTTP status and renders as `{"error": "...", "code": ...}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

use crate::models::ErrorResponse;

pub type FederationResult<T> = Result<T, FederationError>;

#[derive(Debug, Error)]
pub enum FederationError {
    /// Missing or malformed Authorization header, unverifiable signature,
    /// or the origin's key could not be obtained.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The `(domain, eventId)` pair was already processed.
    #[error("event {0} has already been processed")]
    Replay(String),

    /// Unknown event name, malformed envelope or payload failing its shape.
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    /// The authenticated caller may not perform this mutation.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// Outbound call could not be completed (unreachable, timeout, bad body).
    #[error("transport error: {0}")]
    Transport(String),

    /// Outbound call reached the peer, which answered with a non-2xx status.
    #[error("{domain} responded with {status}: {message}")]
    Remote {
        domain: String,
        status: u16,
        message: String,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl FederationError {
    pub fn validation(msg: impl Into<String>) -> Self {
        FederationError::Validation(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        FederationError::Authorization(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        FederationError::NotFound(what.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            FederationError::Authentication(_)
            | FederationError::Replay(_)
            | FederationError::Authorization(_) => StatusCode::UNAUTHORIZED,
            FederationError::Validation(_) => StatusCode::BAD_REQUEST,
            FederationError::NotFound(_) => StatusCode::NOT_FOUND,
            FederationError::Transport(_) | FederationError::Remote { .. } => {
                StatusCode::BAD_GATEWAY
            }
            FederationError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand back to a remote domain.
    pub fn public_message(&self) -> String {
        match self {
            FederationError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for FederationError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Federation: request failed: {}", self);
        }
        let body = ErrorResponse {
            error: self.public_message(),
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}
