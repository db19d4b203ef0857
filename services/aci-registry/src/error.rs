//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::blobs::BlobError;
use crate::session::SessionError;

/// Result type for registry operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Errors surfaced by [`Uploads`](crate::Uploads) operations
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// A session was requested without an image name
    #[error("image name is empty")]
    EmptyName,

    /// The image name cannot be published
    #[error("invalid image name: {0:?}")]
    InvalidName(String),

    /// Unknown or already completed session
    #[error("upload session {0} not found")]
    NotFound(u64),

    /// Session store failure
    #[error(transparent)]
    Session(SessionError),

    /// Blob store failure
    #[error(transparent)]
    Blob(BlobError),

    /// The completion report could not be parsed
    #[error("invalid completion report: {0}")]
    InvalidReport(#[source] serde_json::Error),

    /// Reading a request body failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SessionError> for UploadError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::EmptyName => UploadError::EmptyName,
            SessionError::NotFound(id) => UploadError::NotFound(id),
            error => UploadError::Session(error),
        }
    }
}

impl From<BlobError> for UploadError {
    fn from(error: BlobError) -> Self {
        match error {
            BlobError::InvalidName(name) => UploadError::InvalidName(name),
            error => UploadError::Blob(error),
        }
    }
}

impl UploadError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            UploadError::NotFound(_) => StatusCode::NOT_FOUND,
            UploadError::EmptyName | UploadError::InvalidName(_) | UploadError::InvalidReport(_) => {
                StatusCode::BAD_REQUEST
            }
            UploadError::Session(SessionError::Conflict(_)) => StatusCode::CONFLICT,
            UploadError::Blob(BlobError::KeyNotConfigured) => StatusCode::NOT_FOUND,
            UploadError::Blob(error) if error.is_not_found() => StatusCode::NOT_FOUND,
            UploadError::Session(_) | UploadError::Blob(_) | UploadError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("{self}");
        }

        let body = ErrorResponse {
            error: self.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}
