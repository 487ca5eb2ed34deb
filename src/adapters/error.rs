//! HTTP-facing errors and their JSON rendering.
use std::any::Any;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::{core::Rejection, tracing_setup::ERROR_TARGET};

pub const BUSY_MESSAGE: &str = "Server is busy. Please try again later.";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No slot could be granted.
    #[error("Server is busy. Please try again later.")]
    Busy {
        rejection: Rejection,
        request_id: String,
    },

    #[error("Not Found")]
    NotFound { request_id: Option<String> },

    #[error("Internal Server Error")]
    Internal {
        message: String,
        request_id: Option<String>,
    },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Busy {
                rejection,
                request_id,
            } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": BUSY_MESSAGE,
                    "queued": rejection.queue_depth,
                    "reason": rejection.reason,
                    "request_id": request_id,
                })),
            )
                .into_response(),
            ApiError::NotFound { request_id } => (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "error": "Not Found",
                    "request_id": request_id.as_deref().unwrap_or("unknown"),
                })),
            )
                .into_response(),
            ApiError::Internal {
                message,
                request_id,
            } => {
                let request_id = request_id.as_deref().unwrap_or("unknown");
                tracing::error!(
                    target: ERROR_TARGET,
                    request_id = %request_id,
                    "Unhandled error: {}",
                    message
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "error": "Internal Server Error",
                        "request_id": request_id,
                    })),
                )
                    .into_response()
            }
        }
    }
}

/// Turn a handler panic into a JSON 500. The request id is attached as a
/// header by the request id middleware further out.
pub fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic payload".to_string()
    };

    ApiError::Internal {
        message: format!("handler panicked: {message}"),
        request_id: None,
    }
    .into_response()
}
