//! HTTP implementations of the upload collaborators.
//!
//! [`HttpBackend`] talks JSON to the application backend (record creation,
//! upload authorization, finalize). [`HttpTransport`] streams file bytes to
//! the authorized object-store URL.

mod client;
mod transport;

pub use client::HttpBackend;
pub use transport::HttpTransport;

use directup_upload::UploadError;

/// Errors constructing an HTTP collaborator.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid API token")]
    InvalidToken,

    #[error("invalid base URL: {0}")]
    InvalidUrl(String),
}

/// Maps a request-level failure (no HTTP status) onto the upload taxonomy.
pub(crate) fn request_error(e: reqwest::Error) -> UploadError {
    if e.is_builder() {
        UploadError::NonRetryable(format!("invalid request: {e}"))
    } else if e.is_decode() {
        UploadError::Backend(format!("malformed response: {e}"))
    } else if e.is_timeout() {
        UploadError::Transient(format!("request timed out: {e}"))
    } else if e.is_connect() {
        UploadError::Transient(format!("connection failed: {e}"))
    } else {
        UploadError::Transient(e.to_string())
    }
}
