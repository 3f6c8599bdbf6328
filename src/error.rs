//! Error taxonomy for the messaging core.
//!
//! Persistence and access-control failures abort the operation and surface
//! to the caller; transport failures are recovered internally and only
//! surface after retries are exhausted.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// No verified identity on the request.
    #[error("no verified identity")]
    Unauthenticated,

    /// Identity is not a participant of the conversation. Never downgraded
    /// to an empty result.
    #[error("identity {identity} is not a participant of conversation {conversation_id}")]
    AccessDenied {
        identity: String,
        conversation_id: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    /// Connection-level failure, surfaced only after reconnect attempts
    /// are exhausted.
    #[error("transport failed after {attempts} attempts: {reason}")]
    Transport { attempts: u32, reason: String },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(err.into())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::Unauthenticated => (StatusCode::UNAUTHORIZED, self.to_string()),
            Error::AccessDenied { .. } => (StatusCode::FORBIDDEN, self.to_string()),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            Error::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::Transport { .. } => (StatusCode::BAD_GATEWAY, self.to_string()),
            Error::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_denied_maps_to_forbidden() {
        let err = Error::AccessDenied {
            identity: "u1".into(),
            conversation_id: "c1".into(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn internal_hides_detail() {
        let err = Error::Internal(anyhow::anyhow!("disk on fire"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
