//! JSON error responses.
//!
//! Every failure is rendered as `{success: false, error, code}`. Internal
//! detail stays in the operational log; clients get a readable summary.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::{DeployError, StoreError};

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    code: &'static str,
}

/// An HTTP-facing error
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        match err {
            DeployError::Validation(msg) => Self::bad_request(msg),
            DeployError::Auth(msg) => Self::unauthorized(msg),
            DeployError::NotFound(id) => Self::not_found(format!("Deployment not found: {}", id)),
            DeployError::Persistence(e) => e.into(),
            other => {
                tracing::error!(error = %other, "Deployment request failed");
                Self::internal("Deployment request failed")
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::not_found(format!("Deployment not found: {}", id)),
            StoreError::InvalidTransition(e) => {
                Self::new(StatusCode::CONFLICT, "INVALID_TRANSITION", e.to_string())
            }
            StoreError::InvalidId(id) => Self::bad_request(format!("Invalid deployment id: {}", id)),
            StoreError::AlreadyExists(id) => {
                Self::new(StatusCode::CONFLICT, "ALREADY_EXISTS", format!("Deployment already exists: {}", id))
            }
            other => {
                tracing::error!(error = %other, "Job store failure");
                Self::internal("Job store unavailable")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.message,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}
