use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Record creation
// ---------------------------------------------------------------------------

/// One pending backend record to create before uploading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRecord {
    pub file_name: String,
    pub file_size_bytes: u64,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Creates one pending record per file in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRecordsRequest {
    pub batch_id: String,
    pub records: Vec<PendingRecord>,
}

/// Record ids, in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRecordsResponse {
    pub ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Upload authorization
// ---------------------------------------------------------------------------

/// Exchanges pending record ids for time-limited upload URLs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeUploadsRequest {
    pub ids: Vec<String>,
    pub expiration_hours: u32,
}

/// One granted upload authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationItem {
    pub id: String,
    pub object_key: String,
    pub upload_url: String,
    pub auth_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub expires_in_seconds: u64,
}

/// Response to [`AuthorizeUploadsRequest`].
///
/// Partial failures are reported per id in `errors`, not as a batch error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizeUploadsResponse {
    pub success: bool,
    #[serde(default)]
    pub items: Vec<AuthorizationItem>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub errors: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Finalize
// ---------------------------------------------------------------------------

/// Marks a record complete once its bytes have landed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRecordRequest {
    pub record_id: String,
    pub file_size_bytes: u64,
    pub duration_seconds: f64,
}

/// Response to [`FinalizeRecordRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeRecordResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
