//! Wire types shared between the upload pipeline, its backend and its
//! subscribers.
//!
//! Everything here is plain serde data with camelCase field names so the
//! JSON matches what the web backend speaks.

pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use messages::{
    AuthorizationItem, AuthorizeUploadsRequest, AuthorizeUploadsResponse, CreateRecordsRequest,
    CreateRecordsResponse, FinalizeRecordRequest, FinalizeRecordResponse, PendingRecord,
};
pub use types::{
    ErrorClass, NetworkStatus, UploadBatchProgress, UploadEvent, UploadFileProgress, UploadStatus,
};
