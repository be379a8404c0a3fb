use crate::api::models::classify::ErrorResponse;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error as ThisError;

/// Fallback when the classification service fails without an `error` field.
pub const BACKEND_ERROR_FALLBACK: &str = "classification service error";
/// Fallback for failures between reading the upload and reading the backend reply.
pub const PROCESSING_ERROR_FALLBACK: &str = "Error processing image";
/// Fallback for failures before the upload could be extracted.
pub const INTERNAL_ERROR_FALLBACK: &str = "Internal server error";

#[derive(ThisError, Debug)]
pub enum Error {
    /// Inbound request failed validation and is never forwarded
    #[error("{message}")]
    BadRequest { message: String },

    /// The inbound multipart body could not be read
    #[error("Failed to read multipart upload: {message}")]
    MalformedUpload { message: String },

    /// The classification service could not be reached or did not answer in time
    #[error("Classification service request failed: {message}")]
    BackendTransport { message: String },

    /// The classification service answered with a body that is not JSON
    #[error("Invalid response from classification service")]
    InvalidBackendResponse,

    /// The classification service answered with a failure status
    #[error("Classification service returned {status}: {message}")]
    BackendRejected { status: u16, message: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },
}

impl Error {
    pub fn no_file() -> Self {
        Error::BadRequest {
            message: "No file uploaded".to_string(),
        }
    }

    pub fn not_an_image() -> Self {
        Error::BadRequest {
            message: "File must be an image".to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::MalformedUpload { .. }
            | Error::BackendTransport { .. }
            | Error::InvalidBackendResponse
            | Error::BackendRejected { .. }
            | Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::BadRequest { message } => message.clone(),
            Error::MalformedUpload { message } => non_empty_or(message, INTERNAL_ERROR_FALLBACK),
            Error::BackendTransport { message } => non_empty_or(message, PROCESSING_ERROR_FALLBACK),
            Error::InvalidBackendResponse => "Invalid response from classification service".to_string(),
            Error::BackendRejected { message, .. } => non_empty_or(message, BACKEND_ERROR_FALLBACK),
            Error::Internal { .. } => PROCESSING_ERROR_FALLBACK.to_string(),
        }
    }

    /// Short label used for the classification outcome metric
    pub fn outcome(&self) -> &'static str {
        match self {
            Error::BadRequest { .. } => "rejected",
            Error::MalformedUpload { .. } => "malformed_upload",
            Error::BackendTransport { .. } => "backend_unreachable",
            Error::InvalidBackendResponse => "backend_invalid_response",
            Error::BackendRejected { .. } => "backend_error",
            Error::Internal { .. } => "internal",
        }
    }
}

fn non_empty_or(message: &str, fallback: &str) -> String {
    if message.trim().is_empty() {
        fallback.to_string()
    } else {
        message.to_string()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Internal { .. } => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::BackendTransport { .. } | Error::InvalidBackendResponse | Error::BackendRejected { .. } => {
                tracing::error!("Classification backend error: {}", self);
            }
            Error::MalformedUpload { .. } => {
                tracing::warn!("Request error: {}", self);
            }
            Error::BadRequest { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();
        let body = ErrorResponse { error: self.user_message() };
        (status, Json(body)).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
