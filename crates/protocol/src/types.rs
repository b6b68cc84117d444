//! Status enums and progress payloads published to subscribers.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a single file upload.
///
/// Stalling is not a state: it is reported through
/// [`UploadFileProgress::is_stalled`] while the file stays `Uploading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "uploading")]
    Uploading,
    #[serde(rename = "retrying")]
    Retrying,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "aborted")]
    Aborted,
}

impl UploadStatus {
    /// Returns `true` for `Completed`, `Failed` and `Aborted`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Returns `true` while a worker holds the file.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Uploading | Self::Retrying)
    }
}

/// Coarse connectivity state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    #[default]
    Online,
    Offline,
    Slow,
}

/// How a failed attempt is treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
    /// The upload token expired; fetch a fresh authorization and retry.
    AuthRefresh,
    Offline,
    Cancelled,
}

/// Progress snapshot for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFileProgress {
    pub file_name: String,
    pub file_size_bytes: u64,
    pub uploaded_bytes: u64,
    pub status: UploadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub upload_speed_bps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    pub is_stalled: bool,
}

impl UploadFileProgress {
    /// Returns the file progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.file_size_bytes == 0 {
            return 0.0;
        }
        self.uploaded_bytes as f64 / self.file_size_bytes as f64 * 100.0
    }
}

/// Aggregate progress for a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadBatchProgress {
    pub batch_id: String,
    pub total_files: usize,
    pub completed_files: usize,
    pub failed_files: usize,
    pub files: Vec<UploadFileProgress>,
}

impl UploadBatchProgress {
    /// Returns `true` once every file has reached a terminal state.
    pub fn is_settled(&self) -> bool {
        self.completed_files + self.failed_files == self.total_files
    }
}

/// Event delivered to pipeline subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadEvent {
    File {
        #[serde(rename = "batchId")]
        batch_id: String,
        progress: UploadFileProgress,
    },
    Batch(UploadBatchProgress),
}

impl UploadEvent {
    /// Returns the batch this event belongs to.
    pub fn batch_id(&self) -> &str {
        match self {
            Self::File { batch_id, .. } => batch_id,
            Self::Batch(b) => &b.batch_id,
        }
    }
}
