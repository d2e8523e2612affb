//! Error taxonomy shared by the HTTP and live-connection paths.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::entity::InvalidId;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Only administrators may perform this action")]
    Permission,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Validation(_) | ChatError::Conflict(_) => StatusCode::BAD_REQUEST,
            ChatError::Permission => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Transport(_) | ChatError::Persistence(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "VALIDATION_ERROR",
            ChatError::Conflict(_) => "CONFLICT",
            ChatError::Permission => "FORBIDDEN",
            ChatError::NotFound(_) => "NOT_FOUND",
            ChatError::Transport(_) => "TRANSPORT_ERROR",
            ChatError::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }

    /// Message safe to show a client. Store details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ChatError::Persistence(_) => "Storage unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.public_message(),
            }
        }));

        (self.status(), body).into_response()
    }
}

impl From<anyhow::Error> for ChatError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Store error: {:#}", err);
        ChatError::Persistence(format!("{:#}", err))
    }
}

impl From<InvalidId> for ChatError {
    fn from(err: InvalidId) -> Self {
        ChatError::Validation(err.to_string())
    }
}

impl From<JsonRejection> for ChatError {
    fn from(rejection: JsonRejection) -> Self {
        ChatError::Validation(rejection.body_text())
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
