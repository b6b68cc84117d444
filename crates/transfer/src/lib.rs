//! Per-file transfer state for direct-to-storage uploads.
//!
//! Holds the pieces a transfer worker owns while moving one file: the
//! content hash sent as an integrity header, the throughput sampler and
//! stall detector behind progress reporting, and the [`FileUploadTask`]
//! record itself.

mod checksum;
mod progress;
mod types;

pub use checksum::{ContentHasher, Md5Hasher, Sha256Hasher};
pub use progress::{StallDetector, ThroughputSampler};
pub use types::{FileUploadTask, RETRY_LOG_CAPACITY, RetryAttempt, RetryLog};

/// Read buffer used when hashing files: 64 KiB.
pub const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
