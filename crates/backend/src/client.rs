use std::time::Duration;

use directup_protocol::{
    AuthorizeUploadsRequest, AuthorizeUploadsResponse, CreateRecordsRequest,
    CreateRecordsResponse, FinalizeRecordRequest, FinalizeRecordResponse, PendingRecord,
};
use directup_upload::{
    Authorization, AuthorizationClient, AuthorizationResults, BoxFuture, FinalizeClient,
    RecordCreator, UploadError,
};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{BackendError, request_error};

/// Timeout for backend JSON calls.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Application backend: records, authorizations, finalize.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
    expiration_hours: u32,
    required_fields: Vec<String>,
}

impl HttpBackend {
    /// Creates a client for `base_url`, sending `api_token` as a Bearer token.
    pub fn new(base_url: &str, api_token: Option<&str>) -> Result<Self, BackendError> {
        let base_url = base_url.trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(BackendError::InvalidUrl(base_url.to_string()));
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = api_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| BackendError::InvalidToken)?,
            );
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(RPC_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.to_string(),
            expiration_hours: 1,
            required_fields: Vec::new(),
        })
    }

    /// Lifetime requested for upload authorizations.
    pub fn with_expiration_hours(mut self, hours: u32) -> Self {
        self.expiration_hours = hours;
        self
    }

    /// Metadata keys the backend needs on every record.
    pub fn with_required_fields(mut self, fields: Vec<String>) -> Self {
        self.required_fields = fields;
        self
    }

    async fn post<Req, Resp>(&self, endpoint: &str, body: &Req) -> Result<Resp, UploadError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, endpoint);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(request_error)?;
        let status = resp.status();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &body));
        }

        let bytes = resp.bytes().await.map_err(request_error)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Maps a non-2xx backend answer onto the upload taxonomy.
fn status_error(status: u16, body: &str) -> UploadError {
    let detail = if body.trim().is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", body.trim())
    };
    match status {
        408 | 429 | 500..=599 => UploadError::Backend(detail),
        401 | 403 => UploadError::Authorization(detail),
        _ => UploadError::NonRetryable(detail),
    }
}

impl RecordCreator for HttpBackend {
    fn required_fields(&self) -> Vec<String> {
        self.required_fields.clone()
    }

    fn create_records<'a>(
        &'a self,
        batch_id: &'a str,
        records: &'a [PendingRecord],
    ) -> BoxFuture<'a, Result<Vec<String>, UploadError>> {
        Box::pin(async move {
            let req = CreateRecordsRequest {
                batch_id: batch_id.to_string(),
                records: records.to_vec(),
            };
            let resp: CreateRecordsResponse = self.post("/records", &req).await?;
            debug!(batch = %batch_id, count = resp.ids.len(), "records created");
            Ok(resp.ids)
        })
    }
}

impl AuthorizationClient for HttpBackend {
    fn authorize<'a>(
        &'a self,
        batch_id: &'a str,
        record_ids: &'a [String],
    ) -> BoxFuture<'a, Result<AuthorizationResults, UploadError>> {
        Box::pin(async move {
            let req = AuthorizeUploadsRequest {
                ids: record_ids.to_vec(),
                expiration_hours: self.expiration_hours,
            };
            let resp: AuthorizeUploadsResponse = self.post("/uploads/authorize", &req).await?;
            debug!(
                batch = %batch_id,
                granted = resp.items.len(),
                refused = resp.errors.len(),
                "authorizations received"
            );
            Ok(collect_authorizations(record_ids, resp))
        })
    }
}

/// Builds a per-id result map; ids the server did not mention are refused.
fn collect_authorizations(
    record_ids: &[String],
    resp: AuthorizeUploadsResponse,
) -> AuthorizationResults {
    let mut results = AuthorizationResults::new();
    for item in resp.items {
        results.insert(item.id.clone(), Ok(Authorization::from(item)));
    }
    for (id, reason) in resp.errors {
        results.entry(id).or_insert(Err(reason));
    }

    let fallback = if resp.success {
        "no authorization returned"
    } else {
        "authorization request rejected"
    };
    for id in record_ids {
        results
            .entry(id.clone())
            .or_insert_with(|| Err(fallback.to_string()));
    }
    results
}

impl FinalizeClient for HttpBackend {
    fn finalize<'a>(
        &'a self,
        record_id: &'a str,
        size_bytes: u64,
        duration: Duration,
    ) -> BoxFuture<'a, Result<(), UploadError>> {
        Box::pin(async move {
            let req = FinalizeRecordRequest {
                record_id: record_id.to_string(),
                file_size_bytes: size_bytes,
                duration_seconds: duration.as_secs_f64(),
            };
            let resp: FinalizeRecordResponse = self.post("/records/finalize", &req).await?;
            if resp.success {
                debug!(record = %record_id, "record finalized");
                Ok(())
            } else {
                Err(UploadError::NonRetryable(
                    resp.error.unwrap_or_else(|| "finalize rejected".into()),
                ))
            }
        })
    }
}
