//! Single-file transfer worker.
//!
//! Runs the attempt loop for one file: hash, stream, classify failures,
//! back off, re-authorize when the upload token expired, and finalize the
//! record once the bytes have landed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use directup_protocol::{ErrorClass, NetworkStatus, UploadStatus};
use directup_transfer::{
    ContentHasher, FileUploadTask, RetryAttempt, StallDetector, ThroughputSampler,
};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{
    Authorization, AuthorizationClient, FinalizeClient, ObjectTransport, TransferRequest,
};
use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::network::NetworkMonitor;
use crate::retry::RetryPolicy;
use crate::validation::UploadFile;

/// How often an in-flight transfer is checked for a stall.
pub const STALL_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Callback receiving a copy of the task after every visible change.
pub type ProgressSink<'a> = &'a (dyn Fn(&FileUploadTask) + Send + Sync);

/// Uploads one file: attempts, retries, and the final commit.
#[derive(Clone)]
pub struct FileTransferWorker {
    config: Arc<UploadConfig>,
    policy: RetryPolicy,
    monitor: NetworkMonitor,
    hasher: Arc<dyn ContentHasher>,
    transport: Arc<dyn ObjectTransport>,
    authorizer: Arc<dyn AuthorizationClient>,
    finalizer: Arc<dyn FinalizeClient>,
}

impl FileTransferWorker {
    pub fn new(
        config: Arc<UploadConfig>,
        monitor: NetworkMonitor,
        hasher: Arc<dyn ContentHasher>,
        transport: Arc<dyn ObjectTransport>,
        authorizer: Arc<dyn AuthorizationClient>,
        finalizer: Arc<dyn FinalizeClient>,
    ) -> Self {
        Self {
            policy: RetryPolicy::from_config(&config),
            config,
            monitor,
            hasher,
            transport,
            authorizer,
            finalizer,
        }
    }

    /// Drives `task` to a terminal status and returns it.
    ///
    /// Never returns an error: every failure ends up on the task.
    pub async fn upload(
        &self,
        batch_id: &str,
        file: &UploadFile,
        mut task: FileUploadTask,
        mut authorization: Authorization,
        on_progress: ProgressSink<'_>,
        cancel: &CancellationToken,
    ) -> FileUploadTask {
        let started = Instant::now();
        let mut digest: Option<String> = None;
        let mut needs_refresh = false;
        task.remote_object_key = Some(authorization.object_key.clone());

        loop {
            if cancel.is_cancelled() {
                return self.abort(batch_id, task, on_progress);
            }

            let outcome = if needs_refresh {
                self.refresh_authorization(batch_id, &task).await
            } else {
                Ok(None)
            };
            let outcome = match outcome {
                Ok(fresh) => {
                    if let Some(fresh) = fresh {
                        debug!(
                            batch = %batch_id,
                            file = %file.file_name,
                            "authorization refreshed"
                        );
                        task.remote_object_key = Some(fresh.object_key.clone());
                        authorization = fresh;
                        needs_refresh = false;
                    }
                    task.begin_attempt();
                    on_progress(&task);
                    debug!(
                        batch = %batch_id,
                        file = %file.file_name,
                        attempt = task.retry_count + 1,
                        "starting transfer attempt"
                    );
                    self.upload_once(
                        file,
                        &mut task,
                        &authorization,
                        &mut digest,
                        on_progress,
                        cancel,
                    )
                    .await
                }
                Err(e) => {
                    warn!(
                        batch = %batch_id,
                        file = %file.file_name,
                        error = %e,
                        "authorization refresh failed"
                    );
                    Err(e)
                }
            };

            let err = match outcome {
                Ok(()) => {
                    return self
                        .commit(batch_id, file, task, started.elapsed(), on_progress, cancel)
                        .await;
                }
                Err(e) => e,
            };

            let attempt = task.retry_count;
            let network = self.monitor.status();
            let class = err.class();
            let will_retry = self
                .policy
                .should_retry(&err, attempt, cancel.is_cancelled(), network);
            task.retry_log.push(RetryAttempt {
                attempt_number: attempt + 1,
                timestamp: Utc::now(),
                error_class: class,
                will_retry,
            });

            if !will_retry {
                if cancel.is_cancelled() || class == ErrorClass::Cancelled {
                    return self.abort(batch_id, task, on_progress);
                }
                // A dropped link hides the real cause of a transient error.
                let offline = network == NetworkStatus::Offline
                    && matches!(class, ErrorClass::Retryable | ErrorClass::Offline);
                let reason = if offline {
                    UploadError::Offline.to_string()
                } else {
                    err.to_string()
                };
                error!(
                    batch = %batch_id,
                    file = %file.file_name,
                    retries = attempt,
                    error = %reason,
                    "upload failed"
                );
                task.fail(reason);
                on_progress(&task);
                return task;
            }

            if class == ErrorClass::AuthRefresh {
                needs_refresh = true;
            }

            let delay = self.policy.compute_delay(attempt);
            task.retry_count += 1;
            task.status = UploadStatus::Retrying;
            task.error = Some(err.to_string());
            task.is_stalled = false;
            task.upload_speed_bps = 0.0;
            task.eta_seconds = None;
            warn!(
                batch = %batch_id,
                file = %file.file_name,
                retry = task.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transfer attempt failed, retrying"
            );
            on_progress(&task);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.abort(batch_id, task, on_progress),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One transfer attempt, without retry.
    async fn upload_once(
        &self,
        file: &UploadFile,
        task: &mut FileUploadTask,
        authorization: &Authorization,
        digest: &mut Option<String>,
        on_progress: ProgressSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        if self.monitor.is_offline() {
            return Err(UploadError::Offline);
        }

        let hash_value = match digest {
            Some(value) => value.clone(),
            None => {
                let value = self.hash(file).await?;
                *digest = Some(value.clone());
                value
            }
        };

        let request = TransferRequest {
            path: file.path.clone(),
            upload_url: authorization.upload_url.clone(),
            auth_token: authorization.auth_token.clone(),
            content_type: authorization
                .content_type
                .clone()
                .unwrap_or_else(|| file.content_type.clone()),
            size_bytes: file.size_bytes,
            hash_header: self.hasher.header_name(),
            hash_value,
        };

        let timeout = self.config.transfer_timeout(file.size_bytes);
        let start = Instant::now();
        let mut sampler = ThroughputSampler::new(None, start.into_std());
        let mut stall = StallDetector::new(self.config.stall_threshold(), start.into_std());
        let mut stall_check =
            tokio::time::interval_at(start + STALL_CHECK_INTERVAL, STALL_CHECK_INTERVAL);
        stall_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<u64>();
        let transfer_cancel = cancel.child_token();
        let transfer = self
            .transport
            .put_object(&request, progress_tx, transfer_cancel.clone());
        tokio::pin!(transfer);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    transfer_cancel.cancel();
                    break Err(UploadError::Cancelled);
                }
                _ = &mut deadline => {
                    transfer_cancel.cancel();
                    break Err(UploadError::Transient(format!(
                        "transfer timed out after {}s",
                        timeout.as_secs()
                    )));
                }
                Some(sent) = progress_rx.recv() => {
                    self.on_bytes(file, task, sent, &mut sampler, &mut stall, on_progress);
                }
                outcome = &mut transfer => break outcome,
                _ = stall_check.tick() => {
                    if stall.check(Instant::now().into_std()) {
                        task.is_stalled = stall.is_stalled();
                        if task.is_stalled {
                            warn!(
                                file = %file.file_name,
                                uploaded = task.uploaded_bytes,
                                "transfer stalled"
                            );
                        }
                        on_progress(task);
                    }
                }
            }
        };

        // Updates sent in the same poll that completed the transfer.
        while let Ok(sent) = progress_rx.try_recv() {
            self.on_bytes(file, task, sent, &mut sampler, &mut stall, on_progress);
        }

        result
    }

    fn on_bytes(
        &self,
        file: &UploadFile,
        task: &mut FileUploadTask,
        sent: u64,
        sampler: &mut ThroughputSampler,
        stall: &mut StallDetector,
        on_progress: ProgressSink<'_>,
    ) {
        let now = Instant::now().into_std();
        stall.on_progress(now);
        let mut changed = std::mem::take(&mut task.is_stalled);

        if let Some(speed) = sampler.record(sent, now) {
            task.upload_speed_bps = speed;
            self.monitor.record_throughput(speed);
        }
        task.eta_seconds = sampler.eta_seconds(file.size_bytes.saturating_sub(sent));
        changed |= task.advance(sent);

        if changed {
            on_progress(task);
        }
    }

    async fn hash(&self, file: &UploadFile) -> Result<String, UploadError> {
        let hasher = Arc::clone(&self.hasher);
        let path = file.path.clone();
        let value = tokio::task::spawn_blocking(move || hasher.hash_file(&path))
            .await
            .map_err(|e| UploadError::Internal(format!("hash task failed: {e}")))??;
        Ok(value)
    }

    /// Requests a fresh authorization for one file.
    async fn refresh_authorization(
        &self,
        batch_id: &str,
        task: &FileUploadTask,
    ) -> Result<Option<Authorization>, UploadError> {
        let record_id = task
            .record_id
            .clone()
            .ok_or_else(|| UploadError::Authorization("task has no record id".into()))?;
        let ids = [record_id];
        let mut results = self.authorizer.authorize(batch_id, &ids).await?;
        match results.remove(&ids[0]) {
            Some(Ok(authorization)) => Ok(Some(authorization)),
            Some(Err(reason)) => Err(UploadError::Authorization(reason)),
            None => Err(UploadError::Authorization(
                "no authorization returned".into(),
            )),
        }
    }

    /// Finalizes the record of a transferred file and completes the task.
    async fn commit(
        &self,
        batch_id: &str,
        file: &UploadFile,
        mut task: FileUploadTask,
        duration: Duration,
        on_progress: ProgressSink<'_>,
        cancel: &CancellationToken,
    ) -> FileUploadTask {
        let outcome = match task.record_id.clone() {
            Some(record_id) => {
                self.finalize_with_retry(&record_id, file.size_bytes, duration, cancel)
                    .await
            }
            None => Err(UploadError::Backend("task has no record id".into())),
        };

        match outcome {
            Ok(()) => {
                task.complete();
                info!(
                    batch = %batch_id,
                    file = %file.file_name,
                    bytes = file.size_bytes,
                    retries = task.retry_count,
                    elapsed_ms = duration.as_millis() as u64,
                    "upload complete"
                );
            }
            Err(UploadError::Cancelled) => return self.abort(batch_id, task, on_progress),
            Err(e) => {
                error!(batch = %batch_id, file = %file.file_name, error = %e, "finalize failed");
                task.fail(format!("finalize failed: {e}"));
            }
        }
        on_progress(&task);
        task
    }

    async fn finalize_with_retry(
        &self,
        record_id: &str,
        size_bytes: u64,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        let mut attempt = 0;
        loop {
            let err = match self.finalizer.finalize(record_id, size_bytes, duration).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            if !self
                .policy
                .should_retry(&err, attempt, false, self.monitor.status())
            {
                return Err(err);
            }
            let delay = self.policy.compute_delay(attempt);
            attempt += 1;
            warn!(record = %record_id, retry = attempt, error = %err, "finalize failed, retrying");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn abort(
        &self,
        batch_id: &str,
        mut task: FileUploadTask,
        on_progress: ProgressSink<'_>,
    ) -> FileUploadTask {
        info!(batch = %batch_id, file = %task.file_name, "upload aborted");
        task.abort();
        on_progress(&task);
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryBackend, ScriptedTransport, Step, fast_config, write_files};
    use directup_transfer::Md5Hasher;
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        file: UploadFile,
        backend: Arc<MemoryBackend>,
        transport: Arc<ScriptedTransport>,
        monitor: NetworkMonitor,
        worker: FileTransferWorker,
    }

    fn harness(config: UploadConfig, setup: impl FnOnce(&ScriptedTransport)) -> Harness {
        let dir = TempDir::new().unwrap();
        let file = write_files(dir.path(), 1, 4096).remove(0);
        let monitor = NetworkMonitor::default();
        let backend = Arc::new(MemoryBackend::new());
        backend.register("rec-7", &file.file_name);
        let transport = ScriptedTransport::new().with_monitor(monitor.clone());
        setup(&transport);
        let transport = Arc::new(transport);
        let worker = FileTransferWorker::new(
            Arc::new(config),
            monitor.clone(),
            Arc::new(Md5Hasher),
            transport.clone(),
            backend.clone(),
            backend.clone(),
        );
        Harness {
            _dir: dir,
            file,
            backend,
            transport,
            monitor,
            worker,
        }
    }

    impl Harness {
        fn task(&self) -> FileUploadTask {
            let mut task = FileUploadTask::new(&self.file.file_name, self.file.size_bytes);
            task.record_id = Some("rec-7".into());
            task
        }

        async fn run(&self, cancel: &CancellationToken) -> (FileUploadTask, Vec<FileUploadTask>) {
            let seen = Mutex::new(Vec::new());
            let sink = |t: &FileUploadTask| seen.lock().unwrap().push(t.clone());
            let auth = self.backend.authorization_for("rec-7");
            let task = self
                .worker
                .upload("batch-1", &self.file, self.task(), auth, &sink, cancel)
                .await;
            (task, seen.into_inner().unwrap())
        }
    }

    #[tokio::test]
    async fn successful_upload_finalizes_once() {
        let h = harness(fast_config(), |_| {});
        let (task, seen) = h.run(&CancellationToken::new()).await;

        assert_eq!(task.status, UploadStatus::Completed);
        assert_eq!(task.uploaded_bytes, 4096);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.remote_object_key.as_deref(), Some("objects/rec-7/clip-0.mp4"));
        assert_eq!(h.backend.finalize_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.backend.finalized.lock().unwrap()["rec-7"], 4096);
        assert_eq!(seen.first().unwrap().status, UploadStatus::Uploading);
        assert_eq!(seen.last().unwrap().status, UploadStatus::Completed);
    }

    #[tokio::test]
    async fn byte_progress_never_moves_backwards() {
        let h = harness(fast_config(), |t| {
            t.script("clip-0.mp4", vec![Step::Reset, Step::Succeed]);
        });
        let (task, seen) = h.run(&CancellationToken::new()).await;
        assert_eq!(task.status, UploadStatus::Completed);

        let mut last = 0;
        for snapshot in &seen {
            assert!(snapshot.uploaded_bytes >= last, "progress went backwards");
            last = snapshot.uploaded_bytes;
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_succeed() {
        let h = harness(fast_config(), |t| {
            t.script(
                "clip-0.mp4",
                vec![Step::Status(503, ""), Step::Status(503, ""), Step::Succeed],
            );
        });
        let (task, seen) = h.run(&CancellationToken::new()).await;

        assert_eq!(task.status, UploadStatus::Completed);
        assert_eq!(task.retry_count, 2);
        assert!(task.retry_log.is_empty());
        assert_eq!(h.transport.attempts("clip-0.mp4"), 3);

        // The log is observable while the upload is still in flight.
        let in_flight = seen
            .iter()
            .filter(|t| t.status == UploadStatus::Retrying)
            .max_by_key(|t| t.retry_log.len())
            .unwrap();
        assert_eq!(in_flight.retry_log.len(), 2);
        assert!(in_flight.retry_log.iter().all(|a| a.will_retry));
        assert_eq!(in_flight.retry_log.last().unwrap().attempt_number, 2);
    }

    #[tokio::test]
    async fn forbidden_fails_without_backoff() {
        let config = UploadConfig {
            retry_delay_base_ms: 1000,
            ..Default::default()
        };
        let h = harness(config, |t| {
            t.script("clip-0.mp4", vec![Step::Status(403, "AccessDenied")]);
        });
        let started = std::time::Instant::now();
        let (task, _) = h.run(&CancellationToken::new()).await;

        assert_eq!(task.status, UploadStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert!(task.error.as_deref().unwrap().contains("403"));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(h.transport.attempts("clip-0.mp4"), 1);
        assert_eq!(h.backend.finalize_calls.load(Ordering::SeqCst), 0);
        let entry = task.retry_log.last().unwrap();
        assert_eq!(entry.error_class, ErrorClass::NonRetryable);
        assert!(!entry.will_retry);
    }

    #[tokio::test]
    async fn retries_stop_after_budget() {
        let h = harness(fast_config(), |t| {
            t.script("clip-0.mp4", vec![Step::Reset; 10]);
        });
        let (task, _) = h.run(&CancellationToken::new()).await;

        assert_eq!(task.status, UploadStatus::Failed);
        assert_eq!(task.retry_count, 3);
        assert_eq!(h.transport.attempts("clip-0.mp4"), 4);
        assert!(task.error.as_deref().unwrap().contains("connection reset"));
        // Bytes from the failed attempts stay as the high-water mark.
        assert_eq!(task.uploaded_bytes, 2048);
    }

    #[tokio::test]
    async fn going_offline_fails_without_retry() {
        let h = harness(fast_config(), |t| {
            t.script("clip-0.mp4", vec![Step::GoOffline]);
        });
        let (task, _) = h.run(&CancellationToken::new()).await;

        assert_eq!(task.status, UploadStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.error.as_deref(), Some("network offline"));
        assert!(h.monitor.is_offline());
    }

    #[tokio::test]
    async fn offline_before_start_is_not_attempted() {
        let h = harness(fast_config(), |_| {});
        h.monitor.set_offline(true);
        let (task, _) = h.run(&CancellationToken::new()).await;

        assert_eq!(task.status, UploadStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("network offline"));
        assert_eq!(h.transport.total_attempts(), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed() {
        let h = harness(fast_config(), |t| {
            t.script("clip-0.mp4", vec![Step::Status(401, ""), Step::Succeed]);
        });
        let (task, _) = h.run(&CancellationToken::new()).await;

        assert_eq!(task.status, UploadStatus::Completed);
        assert_eq!(h.backend.authorize_call_count(), 1);
        let tokens = h.transport.tokens.lock().unwrap().clone();
        assert_eq!(tokens.len(), 2);
        assert_ne!(tokens[0].1, tokens[1].1);
    }

    #[tokio::test]
    async fn transient_refresh_error_is_retried() {
        let h = harness(fast_config(), |t| {
            t.script("clip-0.mp4", vec![Step::Status(401, ""), Step::Succeed]);
        });
        h.backend
            .fail_authorize(vec![UploadError::Backend("HTTP 503".into())]);
        let (task, seen) = h.run(&CancellationToken::new()).await;

        assert_eq!(task.status, UploadStatus::Completed);
        assert_eq!(task.retry_count, 2);
        assert_eq!(h.backend.authorize_call_count(), 2);
        assert_eq!(h.transport.attempts("clip-0.mp4"), 2);
        let refresh_failure = seen
            .iter()
            .filter_map(|t| t.retry_log.last())
            .find(|a| a.attempt_number == 2)
            .unwrap();
        assert_eq!(refresh_failure.error_class, ErrorClass::Retryable);
        assert!(refresh_failure.will_retry);
    }

    #[tokio::test]
    async fn refused_refresh_fails_task() {
        let h = harness(fast_config(), |t| {
            t.script("clip-0.mp4", vec![Step::Status(401, "")]);
        });
        h.backend.deny("clip-0.mp4", "record locked");
        let (task, _) = h.run(&CancellationToken::new()).await;

        assert_eq!(task.status, UploadStatus::Failed);
        assert_eq!(task.retry_count, 1);
        assert!(task.error.as_deref().unwrap().contains("record locked"));
        assert_eq!(h.backend.authorize_call_count(), 1);
        assert_eq!(h.transport.attempts("clip-0.mp4"), 1);
    }

    #[tokio::test]
    async fn offline_keeps_client_error_reason() {
        let h = harness(fast_config(), |t| {
            t.script("clip-0.mp4", vec![Step::OfflineStatus(413, "EntityTooLarge")]);
        });
        let (task, _) = h.run(&CancellationToken::new()).await;

        assert_eq!(task.status, UploadStatus::Failed);
        assert!(h.monitor.is_offline());
        let reason = task.error.as_deref().unwrap();
        assert!(reason.contains("413"), "{reason}");
        assert_ne!(reason, "network offline");
    }

    #[tokio::test]
    async fn transient_finalize_errors_are_retried() {
        let h = harness(fast_config(), |_| {});
        h.backend
            .fail_finalize(vec![UploadError::Backend("HTTP 502".into())]);
        let (task, _) = h.run(&CancellationToken::new()).await;

        assert_eq!(task.status, UploadStatus::Completed);
        assert_eq!(h.backend.finalize_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.transport.attempts("clip-0.mp4"), 1);
    }

    #[tokio::test]
    async fn permanent_finalize_error_fails_task() {
        let h = harness(fast_config(), |_| {});
        h.backend
            .fail_finalize(vec![UploadError::NonRetryable("record missing".into())]);
        let (task, _) = h.run(&CancellationToken::new()).await;

        assert_eq!(task.status, UploadStatus::Failed);
        assert!(task.error.as_deref().unwrap().starts_with("finalize failed:"));
        assert_eq!(h.backend.finalize_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_aborts_in_flight_transfer() {
        let h = harness(fast_config(), |t| {
            t.script("clip-0.mp4", vec![Step::Hang]);
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let (task, _) = h.run(&cancel).await;

        assert_eq!(task.status, UploadStatus::Aborted);
        assert_eq!(task.uploaded_bytes, 1024);
        assert_eq!(h.backend.finalize_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_between_attempts() {
        let config = UploadConfig {
            retry_delay_base_ms: 1000,
            retry_delay_max_ms: 30_000,
            ..Default::default()
        };
        let h = harness(config, |t| {
            t.script("clip-0.mp4", vec![Step::Status(500, ""), Step::Succeed]);
        });
        let started = Instant::now();
        let (task, _) = h.run(&CancellationToken::new()).await;

        assert_eq!(task.status, UploadStatus::Completed);
        assert!(started.elapsed() >= Duration::from_millis(850));
        assert!(started.elapsed() < Duration::from_millis(1300));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_finalize_backoff() {
        let config = UploadConfig {
            retry_delay_base_ms: 20_000,
            retry_delay_max_ms: 30_000,
            ..Default::default()
        };
        let h = harness(config, |_| {});
        h.backend
            .fail_finalize(vec![UploadError::Backend("HTTP 502".into())]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let (task, _) = h.run(&cancel).await;

        assert_eq!(task.status, UploadStatus::Aborted);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(h.backend.finalize_calls.load(Ordering::SeqCst), 1);
        assert!(h.backend.finalized.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_transfer_is_flagged() {
        let config = UploadConfig {
            stall_threshold_seconds: 10,
            ..fast_config()
        };
        let h = harness(config, |t| {
            t.script("clip-0.mp4", vec![Step::Hang]);
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.cancel();
        });
        let (task, seen) = h.run(&cancel).await;

        assert_eq!(task.status, UploadStatus::Aborted);
        assert!(seen.iter().any(|t| t.is_stalled));
        assert!(!task.is_stalled);
    }
}
