//! Scripted in-memory collaborators for pipeline tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use directup_protocol::PendingRecord;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    Authorization, AuthorizationClient, AuthorizationResults, BoxFuture, FinalizeClient,
    ObjectTransport, RecordCreator, TransferRequest,
};
use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::network::NetworkMonitor;
use crate::validation::UploadFile;

/// Config with short backoff so retry tests finish quickly.
pub fn fast_config() -> UploadConfig {
    UploadConfig {
        retry_delay_base_ms: 10,
        retry_delay_max_ms: 50,
        ..Default::default()
    }
}

/// Writes `count` files of `size` bytes and describes them.
pub fn write_files(dir: &Path, count: usize, size: usize) -> Vec<UploadFile> {
    (0..count)
        .map(|n| {
            let name = format!("clip-{n}.mp4");
            let path = dir.join(&name);
            std::fs::write(&path, vec![n as u8; size]).unwrap();
            UploadFile::new(path, name, size as u64, "video/mp4")
        })
        .collect()
}

// ---------------------------------------------------------------------------
// MemoryBackend
// ---------------------------------------------------------------------------

/// Record, authorization and finalize endpoints backed by maps.
#[derive(Default)]
pub struct MemoryBackend {
    required: Vec<String>,
    next_id: AtomicUsize,
    names: Mutex<HashMap<String, String>>,
    pub created: Mutex<Vec<PendingRecord>>,
    denied: Mutex<HashMap<String, String>>,
    pub authorize_calls: Mutex<Vec<Vec<String>>>,
    finalize_failures: Mutex<VecDeque<UploadError>>,
    /// First finalize per record wins.
    pub finalized: Mutex<HashMap<String, u64>>,
    pub finalize_calls: AtomicUsize,
    /// Record id of every finalize call, in order.
    pub finalize_records: Mutex<Vec<String>>,
    authorize_failures: Mutex<VecDeque<UploadError>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_required_fields(mut self, fields: &[&str]) -> Self {
        self.required = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Registers a record created outside `create_records`.
    pub fn register(&self, record_id: &str, file_name: &str) {
        self.names
            .lock()
            .unwrap()
            .insert(record_id.to_string(), file_name.to_string());
    }

    /// Every authorization for `file_name` fails with `reason`.
    pub fn deny(&self, file_name: &str, reason: &str) {
        self.denied
            .lock()
            .unwrap()
            .insert(file_name.to_string(), reason.to_string());
    }

    /// Queues errors returned by the next finalize calls.
    pub fn fail_finalize(&self, errors: Vec<UploadError>) {
        self.finalize_failures.lock().unwrap().extend(errors);
    }

    /// Queues errors returned by the next authorize calls.
    pub fn fail_authorize(&self, errors: Vec<UploadError>) {
        self.authorize_failures.lock().unwrap().extend(errors);
    }

    pub fn authorize_call_count(&self) -> usize {
        self.authorize_calls.lock().unwrap().len()
    }

    pub fn authorization_for(&self, record_id: &str) -> Authorization {
        let name = self
            .names
            .lock()
            .unwrap()
            .get(record_id)
            .cloned()
            .unwrap_or_else(|| record_id.to_string());
        let call = self.authorize_call_count();
        Authorization {
            object_key: format!("objects/{record_id}/{name}"),
            upload_url: format!("mem://bucket/objects/{record_id}/{name}"),
            auth_token: format!("token-{record_id}-{call}"),
            content_type: None,
            expires_in_seconds: 3600,
        }
    }
}

impl RecordCreator for MemoryBackend {
    fn required_fields(&self) -> Vec<String> {
        self.required.clone()
    }

    fn create_records<'a>(
        &'a self,
        _batch_id: &'a str,
        records: &'a [PendingRecord],
    ) -> BoxFuture<'a, Result<Vec<String>, UploadError>> {
        Box::pin(async move {
            let mut ids = Vec::with_capacity(records.len());
            let mut names = self.names.lock().unwrap();
            for record in records {
                let id = format!("rec-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
                names.insert(id.clone(), record.file_name.clone());
                ids.push(id);
            }
            self.created.lock().unwrap().extend(records.iter().cloned());
            Ok(ids)
        })
    }
}

impl AuthorizationClient for MemoryBackend {
    fn authorize<'a>(
        &'a self,
        _batch_id: &'a str,
        record_ids: &'a [String],
    ) -> BoxFuture<'a, Result<AuthorizationResults, UploadError>> {
        Box::pin(async move {
            self.authorize_calls.lock().unwrap().push(record_ids.to_vec());
            if let Some(err) = self.authorize_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            let mut results = AuthorizationResults::new();
            for id in record_ids {
                let name = self.names.lock().unwrap().get(id).cloned();
                let denial = name
                    .as_ref()
                    .and_then(|n| self.denied.lock().unwrap().get(n).cloned());
                let outcome = match denial {
                    Some(reason) => Err(reason),
                    None => Ok(self.authorization_for(id)),
                };
                results.insert(id.clone(), outcome);
            }
            Ok(results)
        })
    }
}

impl FinalizeClient for MemoryBackend {
    fn finalize<'a>(
        &'a self,
        record_id: &'a str,
        size_bytes: u64,
        _duration: Duration,
    ) -> BoxFuture<'a, Result<(), UploadError>> {
        Box::pin(async move {
            self.finalize_calls.fetch_add(1, Ordering::SeqCst);
            self.finalize_records
                .lock()
                .unwrap()
                .push(record_id.to_string());
            if let Some(err) = self.finalize_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            self.finalized
                .lock()
                .unwrap()
                .entry(record_id.to_string())
                .or_insert(size_bytes);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// ScriptedTransport
// ---------------------------------------------------------------------------

/// Outcome of one scripted transfer attempt.
#[derive(Debug, Clone)]
pub enum Step {
    /// Sends the file in four progress chunks.
    Succeed,
    /// Answers with an HTTP status.
    Status(u16, &'static str),
    /// Connection reset.
    Reset,
    /// Flips the monitor offline, then fails like a dropped link.
    GoOffline,
    /// Flips the monitor offline, then answers with an HTTP status.
    OfflineStatus(u16, &'static str),
    /// Sends a quarter of the file, then waits for cancellation.
    Hang,
}

/// Transport replaying per-file scripts; unscripted attempts succeed.
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    chunk_delay: Duration,
    monitor: Option<NetworkMonitor>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    attempts: Mutex<HashMap<String, usize>>,
    pub tokens: Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            chunk_delay: Duration::from_millis(5),
            monitor: None,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            attempts: Mutex::new(HashMap::new()),
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn with_monitor(mut self, monitor: NetworkMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn script(&self, file_name: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(file_name.to_string(), steps.into());
    }

    pub fn attempts(&self, file_name: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(file_name)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_attempts(&self) -> usize {
        self.attempts.lock().unwrap().values().sum()
    }

    fn begin(&self, file_name: &str, token: &str) -> Step {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(file_name.to_string())
            .or_default() += 1;
        self.tokens
            .lock()
            .unwrap()
            .push((file_name.to_string(), token.to_string()));
        self.scripts
            .lock()
            .unwrap()
            .get_mut(file_name)
            .and_then(|steps| steps.pop_front())
            .unwrap_or(Step::Succeed)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(active: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ObjectTransport for ScriptedTransport {
    fn put_object<'a>(
        &'a self,
        request: &'a TransferRequest,
        progress: mpsc::UnboundedSender<u64>,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<(), UploadError>> {
        Box::pin(async move {
            let file_name = request
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let step = self.begin(&file_name, &request.auth_token);
            let _active = ActiveGuard::enter(&self.active, &self.max_active);
            let size = request.size_bytes;

            match step {
                Step::Status(code, body) => {
                    tokio::time::sleep(self.chunk_delay).await;
                    Err(UploadError::from_status(code, body))
                }
                Step::Reset => {
                    tokio::time::sleep(self.chunk_delay).await;
                    let _ = progress.send(size / 2);
                    Err(UploadError::Transient("connection reset by peer".into()))
                }
                Step::GoOffline => {
                    if let Some(monitor) = &self.monitor {
                        monitor.set_offline(true);
                    }
                    Err(UploadError::Transient("network is unreachable".into()))
                }
                Step::OfflineStatus(code, body) => {
                    if let Some(monitor) = &self.monitor {
                        monitor.set_offline(true);
                    }
                    Err(UploadError::from_status(code, body))
                }
                Step::Hang => {
                    let _ = progress.send(size / 4);
                    cancel.cancelled().await;
                    Err(UploadError::Cancelled)
                }
                Step::Succeed => {
                    for chunk in 1..=4u64 {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                            _ = tokio::time::sleep(self.chunk_delay) => {}
                        }
                        let _ = progress.send(size * chunk / 4);
                    }
                    Ok(())
                }
            }
        })
    }
}
