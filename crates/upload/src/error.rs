//! Upload error taxonomy and failure classification.

use directup_protocol::ErrorClass;

/// Errors produced by the upload pipeline.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Malformed input batch; rejected before any network call.
    #[error("validation error: {0}")]
    Validation(String),

    /// The backend refused to authorize a file.
    #[error("authorization error: {0}")]
    Authorization(String),

    /// Timeout, connection reset, DNS failure, 5xx, rate limiting.
    #[error("transient network error: {0}")]
    Transient(String),

    /// The upload token expired or was rejected as invalid.
    #[error("upload authorization expired: {0}")]
    AuthRefresh(String),

    /// Bad request, not found, unsupported type, payload too large.
    #[error("upload rejected: {0}")]
    NonRetryable(String),

    #[error("network offline")]
    Offline,

    #[error("cancelled")]
    Cancelled,

    /// A backend RPC failed in a way worth retrying.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] directup_transfer::TransferError),

    #[error("config error: {0}")]
    Config(String),

    #[error("unknown batch: {0}")]
    UnknownBatch(String),

    #[error("batch already running: {0}")]
    BatchRunning(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl UploadError {
    /// Classifies the error for the retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) | Self::Backend(_) => ErrorClass::Retryable,
            Self::AuthRefresh(_) => ErrorClass::AuthRefresh,
            Self::Offline => ErrorClass::Offline,
            Self::Cancelled => ErrorClass::Cancelled,
            _ => ErrorClass::NonRetryable,
        }
    }

    /// Classifies an HTTP-style status returned by the object store.
    ///
    /// `body` is inspected to tell an expired token apart from a plain
    /// permission denial, since S3-compatible stores answer both with 403.
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = if body.trim().is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {}", truncate(body.trim(), 200))
        };

        match status {
            401 => Self::AuthRefresh(detail),
            403 if mentions_expired_token(body) => Self::AuthRefresh(detail),
            408 | 429 => Self::Transient(detail),
            500..=599 => Self::Transient(detail),
            _ => Self::NonRetryable(detail),
        }
    }
}

fn mentions_expired_token(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    ["expired", "expiredtoken", "invalidtoken", "invalid token", "token is invalid"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
