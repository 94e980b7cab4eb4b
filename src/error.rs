use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::models::TicketStatus;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorObject,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
}

/// Failures raised by the queue engine, registry and repositories.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("{0}")]
    Validation(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    /// The ticket is not in the status the requested transition needs.
    #[error("ticket not {expected} (current status: {actual})")]
    InvalidTransition {
        expected: &'static str,
        actual: TicketStatus,
    },

    /// The guarded write matched no row: another operator changed the ticket first.
    #[error("{0}")]
    Conflict(String),

    #[error("repository error: {0}")]
    Repository(String),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        QueueError::Validation(msg.into())
    }

    pub fn ticket_not_found(id: Uuid) -> Self {
        QueueError::NotFound { kind: "ticket", id }
    }

    pub fn service_point_not_found(id: Uuid) -> Self {
        QueueError::NotFound {
            kind: "service point",
            id,
        }
    }

    pub fn lost_race() -> Self {
        QueueError::Conflict("ticket was changed by another operator, refresh and retry".into())
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Repository(format!("db error: {e}"))
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Conflict(&'static str, String),
    Internal(String),
}

impl ApiError {
    fn to_error_response(code: &str, message: &str) -> Json<ErrorResponse> {
        Json(ErrorResponse {
            error: ErrorObject {
                code: code.to_string(),
                message: message.to_string(),
            },
        })
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        let message = e.to_string();
        match e {
            QueueError::Validation(_) => ApiError::BadRequest("VALIDATION_ERROR", message),
            QueueError::NotFound { .. } => ApiError::NotFound("NOT_FOUND", message),
            QueueError::InvalidTransition { .. } => {
                ApiError::Conflict("INVALID_TRANSITION", message)
            }
            QueueError::Conflict(_) => ApiError::Conflict("CONFLICT", message),
            QueueError::Repository(_) => ApiError::Internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(code, msg) => {
                (StatusCode::BAD_REQUEST, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::NotFound(code, msg) => {
                (StatusCode::NOT_FOUND, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Conflict(code, msg) => {
                (StatusCode::CONFLICT, ApiError::to_error_response(code, &msg)).into_response()
            }
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError::to_error_response("INTERNAL", &msg),
            )
                .into_response(),
        }
    }
}
