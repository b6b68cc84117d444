//! Per-file upload state and its bounded retry log.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use directup_protocol::{ErrorClass, UploadFileProgress, UploadStatus};
use serde::{Deserialize, Serialize};

/// Number of failed attempts kept per file.
pub const RETRY_LOG_CAPACITY: usize = 10;

/// One failed attempt of a file upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    /// 1-based attempt that failed.
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub error_class: ErrorClass,
    pub will_retry: bool,
}

/// Bounded ring of the most recent failed attempts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryLog {
    entries: VecDeque<RetryAttempt>,
}

impl RetryLog {
    /// Appends an entry, evicting the oldest beyond [`RETRY_LOG_CAPACITY`].
    pub fn push(&mut self, attempt: RetryAttempt) {
        if self.entries.len() == RETRY_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(attempt);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RetryAttempt> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&RetryAttempt> {
        self.entries.back()
    }
}

/// Lifecycle record of one file in a batch.
///
/// Owned and mutated by the worker that uploads the file; everyone else
/// sees clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadTask {
    pub file_name: String,
    pub file_size_bytes: u64,
    /// High-water mark across attempts.
    pub uploaded_bytes: u64,
    pub status: UploadStatus,
    #[serde(default)]
    pub is_stalled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub upload_speed_bps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_object_key: Option<String>,
    /// Backend record this file was registered under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip)]
    pub retry_log: RetryLog,
}

impl FileUploadTask {
    /// Creates a pending task.
    pub fn new(file_name: impl Into<String>, file_size_bytes: u64) -> Self {
        Self {
            file_name: file_name.into(),
            file_size_bytes,
            uploaded_bytes: 0,
            status: UploadStatus::Pending,
            is_stalled: false,
            error: None,
            retry_count: 0,
            upload_speed_bps: 0.0,
            eta_seconds: None,
            remote_object_key: None,
            record_id: None,
            retry_log: RetryLog::default(),
        }
    }

    /// Marks the start of an attempt: `Uploading` first, `Retrying` after.
    pub fn begin_attempt(&mut self) {
        self.status = if self.retry_count == 0 {
            UploadStatus::Uploading
        } else {
            UploadStatus::Retrying
        };
        self.is_stalled = false;
        self.upload_speed_bps = 0.0;
        self.eta_seconds = None;
    }

    /// Raises the byte high-water mark.
    ///
    /// Returns `true` if `sent` moved it forward.
    pub fn advance(&mut self, sent: u64) -> bool {
        let sent = sent.min(self.file_size_bytes);
        if sent <= self.uploaded_bytes {
            return false;
        }
        self.uploaded_bytes = sent;
        true
    }

    /// Marks the task completed; clears the retry log.
    pub fn complete(&mut self) {
        self.status = UploadStatus::Completed;
        self.uploaded_bytes = self.file_size_bytes;
        self.is_stalled = false;
        self.error = None;
        self.eta_seconds = Some(0.0);
        self.retry_log.clear();
    }

    /// Marks the task failed with a human-readable reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = UploadStatus::Failed;
        self.error = Some(reason.into());
        self.is_stalled = false;
        self.upload_speed_bps = 0.0;
        self.eta_seconds = None;
    }

    /// Marks the task aborted by cancellation.
    pub fn abort(&mut self) {
        self.status = UploadStatus::Aborted;
        self.error = Some("cancelled".into());
        self.is_stalled = false;
        self.upload_speed_bps = 0.0;
        self.eta_seconds = None;
    }

    /// Resets a non-completed task so it can be attempted again.
    pub fn reset(&mut self) {
        self.status = UploadStatus::Pending;
        self.uploaded_bytes = 0;
        self.is_stalled = false;
        self.error = None;
        self.retry_count = 0;
        self.upload_speed_bps = 0.0;
        self.eta_seconds = None;
        self.retry_log.clear();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the subscriber-facing progress view.
    pub fn progress(&self) -> UploadFileProgress {
        UploadFileProgress {
            file_name: self.file_name.clone(),
            file_size_bytes: self.file_size_bytes,
            uploaded_bytes: self.uploaded_bytes,
            status: self.status,
            error: self.error.clone(),
            retry_count: self.retry_count,
            upload_speed_bps: self.upload_speed_bps,
            eta_seconds: self.eta_seconds,
            is_stalled: self.is_stalled,
        }
    }
}
