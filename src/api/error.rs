use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::data_url::DataUrlError;

/// Structured error type for the front-door handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 400 - Image is not a usable data URL.
    InvalidImage,
    /// 404 - A specific MCP session id was not found.
    SessionNotFound(String),
    /// 404 - No connected session declared sampling support.
    NoSamplingSession,
    /// 400 - The chosen session's client cannot do sampling.
    SamplingUnsupported(String),
    /// 502 - The client failed or refused the sampling request.
    SamplingFailed(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidImage => StatusCode::BAD_REQUEST,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NoSamplingSession => StatusCode::NOT_FOUND,
            ApiError::SamplingUnsupported(_) => StatusCode::BAD_REQUEST,
            ApiError::SamplingFailed(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::InvalidImage => "invalid_image",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::NoSamplingSession => "no_sampling_session",
            ApiError::SamplingUnsupported(_) => "sampling_unsupported",
            ApiError::SamplingFailed(_) => "sampling_failed",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::InvalidImage => "Invalid data URL format".to_string(),
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::NoSamplingSession => {
                "No connected MCP client supports sampling.".to_string()
            }
            ApiError::SamplingUnsupported(id) => {
                format!("Session {} did not declare the sampling capability.", id)
            }
            ApiError::SamplingFailed(detail) => format!("Sampling failed: {}.", detail),
        }
    }
}

impl From<DataUrlError> for ApiError {
    fn from(_: DataUrlError) -> Self {
        ApiError::InvalidImage
    }
}

/// Malformed or mistyped JSON bodies get the same envelope as every other
/// front-door error.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
