//! API errors
//!
//! Every handler error renders as `{"error": "..."}` with a status derived
//! from the domain error.

use crate::election::ElectionError;
use crate::lifecycle::LifecycleError;
use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        tracing::warn!(error = %e, "Store request failed");
        Self::unavailable(e.to_string())
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        let status = match &e {
            LifecycleError::InvalidTransition { .. }
            | LifecycleError::Busy { .. }
            | LifecycleError::NothingToAbort => StatusCode::CONFLICT,
            LifecycleError::UnknownMachine(_) => StatusCode::NOT_FOUND,
            LifecycleError::Store(_) | LifecycleError::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        Self::new(status, e.to_string())
    }
}

impl From<ElectionError> for ApiError {
    fn from(e: ElectionError) -> Self {
        let status = match &e {
            ElectionError::NotCandidate { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ElectionError::Contention { .. } => StatusCode::CONFLICT,
            ElectionError::Store(_) | ElectionError::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        Self::new(status, e.to_string())
    }
}
