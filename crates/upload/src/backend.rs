//! Collaborator seams: backend RPCs and the byte transport.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use directup_protocol::{AuthorizationItem, PendingRecord};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::UploadError;

/// Boxed future returned by collaborator trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Time-limited permission to write one object.
#[derive(Debug, Clone, PartialEq)]
pub struct Authorization {
    pub object_key: String,
    pub upload_url: String,
    pub auth_token: String,
    pub content_type: Option<String>,
    pub expires_in_seconds: u64,
}

impl From<AuthorizationItem> for Authorization {
    fn from(item: AuthorizationItem) -> Self {
        Self {
            object_key: item.object_key,
            upload_url: item.upload_url,
            auth_token: item.auth_token,
            content_type: item.content_type,
            expires_in_seconds: item.expires_in_seconds,
        }
    }
}

/// Per-record outcome of an authorization round trip.
///
/// The error side carries the server's reason.
pub type AuthorizationResults = HashMap<String, Result<Authorization, String>>;

/// Registers pending records before any bytes move.
pub trait RecordCreator: Send + Sync {
    /// Metadata keys every file must carry, after merging destination fields.
    fn required_fields(&self) -> Vec<String>;

    /// Creates one record per entry and returns their ids in order.
    fn create_records<'a>(
        &'a self,
        batch_id: &'a str,
        records: &'a [PendingRecord],
    ) -> BoxFuture<'a, Result<Vec<String>, UploadError>>;
}

/// Exchanges record ids for upload authorizations.
pub trait AuthorizationClient: Send + Sync {
    /// One round trip for all `record_ids`; failures are reported per id.
    fn authorize<'a>(
        &'a self,
        batch_id: &'a str,
        record_ids: &'a [String],
    ) -> BoxFuture<'a, Result<AuthorizationResults, UploadError>>;
}

/// Commits a record once its bytes have landed.
///
/// Implementations must be idempotent per record id.
pub trait FinalizeClient: Send + Sync {
    fn finalize<'a>(
        &'a self,
        record_id: &'a str,
        size_bytes: u64,
        duration: Duration,
    ) -> BoxFuture<'a, Result<(), UploadError>>;
}

/// Everything a transport needs to PUT one file.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub path: PathBuf,
    pub upload_url: String,
    pub auth_token: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// Integrity header name and value.
    pub hash_header: &'static str,
    pub hash_value: String,
}

/// Moves a file's bytes to its authorized URL.
pub trait ObjectTransport: Send + Sync {
    /// Streams the file, sending the cumulative byte count on `progress`.
    ///
    /// Must stop promptly once `cancel` fires. Non-2xx answers are mapped
    /// through [`UploadError::from_status`].
    fn put_object<'a>(
        &'a self,
        request: &'a TransferRequest,
        progress: mpsc::UnboundedSender<u64>,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<(), UploadError>>;
}
