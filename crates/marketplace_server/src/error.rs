//! Maps internal errors to HTTP responses at the transport boundary. Per
//! the error-handling design, analysis never surfaces as an HTTP error
//! (failures become an error-markdown `ProductVerdict` instead) - this type
//! is for the input-validation and recon-submission paths only.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use marketplace_protocol::http_types::ErrorResponse;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<marketplace_db::DbError> for ApiError {
    fn from(e: marketplace_db::DbError) -> Self {
        match e {
            marketplace_db::DbError::NotFound(id) => ApiError::NotFound(id),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(id) => (StatusCode::NOT_FOUND, format!("no such job: {id}")),
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "internal error handling request");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
