//! Errors that cross the API/domain boundary.
//!
//! Internal plumbing (persistence, dispatch, standardization) propagates
//! `anyhow::Result`, matching the teacher's convention; this module holds
//! the few error types the HTTP layer needs to render as a response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("job {0} not found")]
    NotFound(i64),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(id) => (StatusCode::NOT_FOUND, format!("job {id} not found")),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "unexpected error handling request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
