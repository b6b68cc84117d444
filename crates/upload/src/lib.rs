//! Resilient direct-to-object-storage upload pipeline.
//!
//! This crate holds the **orchestration logic** for pushing batches of
//! large local files straight into an object store. It has no HTTP
//! dependency: the backend RPCs and the byte transport are traits that
//! `directup-backend` (or a test double) implements.
//!
//! # Pipeline
//!
//! 1. **Validate**: every file must carry the destination metadata the
//!    backend requires; a bad batch is rejected before any network call
//! 2. **Register**: one pending backend record per file
//! 3. **Authorize**: exchange record ids for short-lived upload URLs
//! 4. **Transfer**: bounded pool of workers streaming bytes, with
//!    progress, stall detection and retry
//! 5. **Finalize**: commit each landed file's record

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod network;
pub mod retry;
pub mod snapshot;
pub mod validation;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export primary types for convenience.
pub use backend::{
    Authorization, AuthorizationClient, AuthorizationResults, BoxFuture, FinalizeClient,
    ObjectTransport, RecordCreator, TransferRequest,
};
pub use config::UploadConfig;
pub use coordinator::{BatchHandle, Collaborators, UploadBatch, UploadCoordinator};
pub use error::UploadError;
pub use events::EventHub;
pub use network::NetworkMonitor;
pub use retry::RetryPolicy;
pub use snapshot::{
    BatchSnapshot, FileSnapshotStore, MemorySnapshotStore, SnapshotEntry, SnapshotStore,
};
pub use validation::{DestinationMetadata, UploadFile, detect_content_type};
pub use worker::{FileTransferWorker, ProgressSink};
