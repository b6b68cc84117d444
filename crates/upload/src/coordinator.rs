//! Batch orchestrator.
//!
//! Validates and registers a batch, authorizes it in chunks, runs a bounded
//! pool of transfer workers, and folds their updates into one batch view
//! that drives events and snapshots.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use directup_protocol::{NetworkStatus, UploadBatchProgress, UploadEvent, UploadStatus};
use directup_transfer::{ContentHasher, FileUploadTask, Md5Hasher};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{
    Authorization, AuthorizationClient, FinalizeClient, ObjectTransport, RecordCreator,
};
use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::events::EventHub;
use crate::network::NetworkMonitor;
use crate::snapshot::{BatchSnapshot, SnapshotEntry, SnapshotStore, recover_fresh};
use crate::validation::{DestinationMetadata, UploadFile, validate_batch};
use crate::worker::FileTransferWorker;

/// Opaque reference to a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchHandle {
    batch_id: String,
}

impl BatchHandle {
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }
}

/// Aggregate state of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadBatch {
    pub batch_id: String,
    pub total_files: usize,
    pub completed_files: usize,
    /// Failed and aborted tasks.
    pub failed_files: usize,
    pub tasks: Vec<FileUploadTask>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub network_status: NetworkStatus,
}

impl UploadBatch {
    fn new(batch_id: String, tasks: Vec<FileUploadTask>, network_status: NetworkStatus) -> Self {
        let mut batch = Self {
            batch_id,
            total_files: tasks.len(),
            completed_files: 0,
            failed_files: 0,
            tasks,
            start_time: Utc::now(),
            end_time: None,
            network_status,
        };
        batch.recount();
        batch
    }

    fn recount(&mut self) {
        self.completed_files = self
            .tasks
            .iter()
            .filter(|t| t.status == UploadStatus::Completed)
            .count();
        self.failed_files = self
            .tasks
            .iter()
            .filter(|t| matches!(t.status, UploadStatus::Failed | UploadStatus::Aborted))
            .count();
    }

    /// Every task has reached a terminal status.
    pub fn is_settled(&self) -> bool {
        self.completed_files + self.failed_files == self.total_files
    }

    pub fn aborted_files(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == UploadStatus::Aborted)
            .count()
    }

    pub fn active_files(&self) -> usize {
        self.tasks.iter().filter(|t| t.status.is_active()).count()
    }

    pub fn progress(&self) -> UploadBatchProgress {
        UploadBatchProgress {
            batch_id: self.batch_id.clone(),
            total_files: self.total_files,
            completed_files: self.completed_files,
            failed_files: self.failed_files,
            files: self.tasks.iter().map(FileUploadTask::progress).collect(),
        }
    }
}

/// The injected backend and transport.
#[derive(Clone)]
pub struct Collaborators {
    pub records: Arc<dyn RecordCreator>,
    pub authorizer: Arc<dyn AuthorizationClient>,
    pub finalizer: Arc<dyn FinalizeClient>,
    pub transport: Arc<dyn ObjectTransport>,
}

/// A batch that has been prepared but not run yet.
struct PreparedBatch {
    batch: UploadBatch,
    files: Vec<UploadFile>,
    destination: DestinationMetadata,
    authorizations: Vec<Option<Authorization>>,
}

enum BatchSlot {
    Ready(Box<PreparedBatch>),
    Running,
}

struct BatchEntry {
    cancel: CancellationToken,
    slot: BatchSlot,
}

/// A queued file for the worker pool.
struct Job {
    index: usize,
    task: FileUploadTask,
    authorization: Authorization,
}

/// A task copy sent from a worker to the aggregation loop.
struct TaskUpdate {
    index: usize,
    task: FileUploadTask,
}

/// Orchestrates batches end to end.
///
/// Owns the bounded worker pool per batch and is the single writer of each
/// batch's counters, events and snapshots.
pub struct UploadCoordinator {
    config: Arc<UploadConfig>,
    collaborators: Collaborators,
    hasher: Arc<dyn ContentHasher>,
    monitor: NetworkMonitor,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    events: EventHub,
    batches: Mutex<HashMap<String, BatchEntry>>,
}

impl UploadCoordinator {
    /// Creates a coordinator using MD5 integrity headers and no snapshots.
    pub fn new(config: UploadConfig, collaborators: Collaborators) -> Result<Self, UploadError> {
        config.validate()?;
        let monitor = NetworkMonitor::new(config.slow_threshold_bps);
        Ok(Self {
            config: Arc::new(config),
            collaborators,
            hasher: Arc::new(Md5Hasher),
            monitor,
            snapshots: None,
            events: EventHub::default(),
            batches: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_network_monitor(mut self, monitor: NetworkMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn network_monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    /// Registers a new event subscriber.
    pub fn subscribe(&self) -> mpsc::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    /// Validates, registers and authorizes a batch.
    ///
    /// A validation problem rejects the whole batch before any network call.
    /// Files whose authorization is refused are marked failed; the rest are
    /// ready for [`run`](Self::run).
    pub async fn submit(
        &self,
        files: Vec<UploadFile>,
        destination: &DestinationMetadata,
    ) -> Result<BatchHandle, UploadError> {
        let required = self.collaborators.records.required_fields();
        let records = validate_batch(&files, destination, &required)?;

        let batch_id = uuid::Uuid::new_v4().to_string();
        let total_bytes: u64 = files.iter().map(|f| f.size_bytes).sum();
        info!(batch = %batch_id, files = files.len(), bytes = total_bytes, "submitting batch");

        let ids = self
            .collaborators
            .records
            .create_records(&batch_id, &records)
            .await?;
        if ids.len() != files.len() {
            return Err(UploadError::Backend(format!(
                "expected {} record ids, got {}",
                files.len(),
                ids.len()
            )));
        }

        let mut tasks: Vec<FileUploadTask> = files
            .iter()
            .zip(ids)
            .map(|(file, id)| {
                let mut task = FileUploadTask::new(&file.file_name, file.size_bytes);
                task.record_id = Some(id);
                task
            })
            .collect();

        let authorizations = self.authorize_pending(&batch_id, &mut tasks).await;
        let prepared = PreparedBatch {
            batch: UploadBatch::new(batch_id.clone(), tasks, self.monitor.status()),
            files,
            destination: destination.clone(),
            authorizations,
        };
        Ok(self.register(prepared))
    }

    /// Requests authorizations for every pending task, `batch_size` at a time.
    ///
    /// Refused files are failed in place; the result is indexed like `tasks`.
    async fn authorize_pending(
        &self,
        batch_id: &str,
        tasks: &mut [FileUploadTask],
    ) -> Vec<Option<Authorization>> {
        let mut authorizations = vec![None; tasks.len()];
        let pending: Vec<usize> = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == UploadStatus::Pending && t.record_id.is_some())
            .map(|(i, _)| i)
            .collect();

        for chunk in pending.chunks(self.config.batch_size) {
            let ids: Vec<String> = chunk
                .iter()
                .filter_map(|&i| tasks[i].record_id.clone())
                .collect();
            debug!(batch = %batch_id, count = ids.len(), "requesting upload authorizations");

            let mut results = match self.collaborators.authorizer.authorize(batch_id, &ids).await {
                Ok(results) => results,
                Err(e) => {
                    error!(
                        batch = %batch_id,
                        count = ids.len(),
                        error = %e,
                        "authorization request failed"
                    );
                    for &i in chunk {
                        tasks[i].fail(UploadError::Authorization(e.to_string()).to_string());
                    }
                    continue;
                }
            };

            for (&i, id) in chunk.iter().zip(&ids) {
                match results.remove(id) {
                    Some(Ok(authorization)) => {
                        tasks[i].remote_object_key = Some(authorization.object_key.clone());
                        authorizations[i] = Some(authorization);
                    }
                    Some(Err(reason)) => {
                        warn!(
                            batch = %batch_id,
                            file = %tasks[i].file_name,
                            reason = %reason,
                            "authorization refused"
                        );
                        tasks[i].fail(UploadError::Authorization(reason).to_string());
                    }
                    None => {
                        warn!(
                            batch = %batch_id,
                            file = %tasks[i].file_name,
                            "no authorization returned"
                        );
                        tasks[i].fail(
                            UploadError::Authorization("no authorization returned".into())
                                .to_string(),
                        );
                    }
                }
            }
        }

        authorizations
    }

    fn register(&self, prepared: PreparedBatch) -> BatchHandle {
        let batch_id = prepared.batch.batch_id.clone();
        self.save_snapshot(&prepared.batch, &prepared.files, &prepared.destination);
        self.events.publish(UploadEvent::Batch(prepared.batch.progress()));

        self.batches.lock().unwrap().insert(
            batch_id.clone(),
            BatchEntry {
                cancel: CancellationToken::new(),
                slot: BatchSlot::Ready(Box::new(prepared)),
            },
        );
        BatchHandle { batch_id }
    }

    /// Runs a submitted batch to completion.
    ///
    /// Returns once every task is terminal. Per-file failures are reported
    /// on the batch; only an unknown or already-running batch is an error.
    pub async fn run(&self, handle: &BatchHandle) -> Result<UploadBatch, UploadError> {
        let batch_id = handle.batch_id().to_string();
        let (prepared, cancel) = self.take_prepared(&batch_id)?;
        let PreparedBatch {
            mut batch,
            files,
            destination,
            authorizations,
        } = *prepared;

        let mut jobs = VecDeque::new();
        for (index, authorization) in authorizations.into_iter().enumerate() {
            let task = &batch.tasks[index];
            if let (UploadStatus::Pending, Some(authorization)) = (task.status, authorization) {
                jobs.push_back(Job {
                    index,
                    task: task.clone(),
                    authorization,
                });
            }
        }

        let total_bytes: u64 = files.iter().map(|f| f.size_bytes).sum();
        let lanes = self
            .config
            .effective_concurrency(files.len(), total_bytes)
            .min(jobs.len());
        info!(
            batch = %batch_id,
            files = batch.total_files,
            runnable = jobs.len(),
            concurrency = lanes,
            "starting batch"
        );

        let files = Arc::new(files);
        let queue = Arc::new(Mutex::new(jobs));
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskUpdate>();
        let worker = FileTransferWorker::new(
            Arc::clone(&self.config),
            self.monitor.clone(),
            Arc::clone(&self.hasher),
            Arc::clone(&self.collaborators.transport),
            Arc::clone(&self.collaborators.authorizer),
            Arc::clone(&self.collaborators.finalizer),
        );

        let mut pool = JoinSet::new();
        for _ in 0..lanes {
            let worker = worker.clone();
            let queue = Arc::clone(&queue);
            let files = Arc::clone(&files);
            let tx = tx.clone();
            let cancel = cancel.clone();
            let batch_id = batch_id.clone();
            pool.spawn(async move {
                loop {
                    let next = queue.lock().unwrap().pop_front();
                    let Some(Job {
                        index,
                        mut task,
                        authorization,
                    }) = next
                    else {
                        break;
                    };

                    if cancel.is_cancelled() {
                        task.abort();
                        let _ = tx.send(TaskUpdate { index, task });
                        continue;
                    }

                    let on_progress = |t: &FileUploadTask| {
                        let _ = tx.send(TaskUpdate {
                            index,
                            task: t.clone(),
                        });
                    };
                    worker
                        .upload(
                            &batch_id,
                            &files[index],
                            task,
                            authorization,
                            &on_progress,
                            &cancel,
                        )
                        .await;
                }
            });
        }
        drop(tx);

        while let Some(update) = rx.recv().await {
            self.apply_update(&mut batch, update, &files, &destination);
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!(batch = %batch_id, error = %e, "upload worker terminated abnormally");
            }
        }

        // Anything still open here lost its worker.
        let mut orphaned = false;
        for task in batch.tasks.iter_mut().filter(|t| !t.is_terminal()) {
            if cancel.is_cancelled() {
                task.abort();
            } else {
                task.fail("upload worker terminated unexpectedly");
            }
            orphaned = true;
        }
        if orphaned {
            batch.recount();
        }

        batch.end_time = Some(Utc::now());
        batch.network_status = self.monitor.status();
        self.events.publish(UploadEvent::Batch(batch.progress()));
        self.settle_snapshot(&batch, &files, &destination);
        self.batches.lock().unwrap().remove(&batch_id);

        info!(
            batch = %batch_id,
            completed = batch.completed_files,
            failed = batch.failed_files,
            aborted = batch.aborted_files(),
            "batch settled"
        );
        Ok(batch)
    }

    fn take_prepared(
        &self,
        batch_id: &str,
    ) -> Result<(Box<PreparedBatch>, CancellationToken), UploadError> {
        let mut batches = self.batches.lock().unwrap();
        let entry = batches
            .get_mut(batch_id)
            .ok_or_else(|| UploadError::UnknownBatch(batch_id.to_string()))?;
        match std::mem::replace(&mut entry.slot, BatchSlot::Running) {
            BatchSlot::Ready(prepared) => Ok((prepared, entry.cancel.clone())),
            BatchSlot::Running => Err(UploadError::BatchRunning(batch_id.to_string())),
        }
    }

    /// Folds one worker update into the batch and fans it out.
    fn apply_update(
        &self,
        batch: &mut UploadBatch,
        update: TaskUpdate,
        files: &[UploadFile],
        destination: &DestinationMetadata,
    ) {
        let TaskUpdate { index, task } = update;
        let previous = batch.tasks[index].status;
        if previous.is_terminal() {
            debug!(
                batch = %batch.batch_id,
                file = %task.file_name,
                "ignoring update for settled file"
            );
            return;
        }

        let status_changed = previous != task.status;
        match task.status {
            UploadStatus::Completed => batch.completed_files += 1,
            UploadStatus::Failed | UploadStatus::Aborted => batch.failed_files += 1,
            _ => {}
        }
        let progress = task.progress();
        batch.tasks[index] = task;

        self.events.publish(UploadEvent::File {
            batch_id: batch.batch_id.clone(),
            progress,
        });
        self.events.publish(UploadEvent::Batch(batch.progress()));

        if status_changed {
            self.save_snapshot(batch, files, destination);
        }
    }

    fn save_snapshot(
        &self,
        batch: &UploadBatch,
        files: &[UploadFile],
        destination: &DestinationMetadata,
    ) {
        let Some(store) = &self.snapshots else {
            return;
        };
        let snapshot = BatchSnapshot {
            batch_id: batch.batch_id.clone(),
            saved_at: Utc::now(),
            destination: destination.clone(),
            entries: files
                .iter()
                .zip(&batch.tasks)
                .map(|(file, task)| SnapshotEntry {
                    file: file.clone(),
                    task: task.clone(),
                })
                .collect(),
        };
        if let Err(e) = store.save(&snapshot) {
            warn!(batch = %batch.batch_id, error = %e, "failed to save batch snapshot");
        }
    }

    /// Drops the snapshot of a fully completed batch, keeps it otherwise.
    fn settle_snapshot(
        &self,
        batch: &UploadBatch,
        files: &[UploadFile],
        destination: &DestinationMetadata,
    ) {
        let Some(store) = &self.snapshots else {
            return;
        };
        if batch.failed_files == 0 {
            if let Err(e) = store.remove(&batch.batch_id) {
                warn!(batch = %batch.batch_id, error = %e, "failed to remove batch snapshot");
            }
        } else {
            self.save_snapshot(batch, files, destination);
        }
    }

    /// Cancels a batch. Safe to call repeatedly or for unknown ids.
    pub fn cancel(&self, batch_id: &str) {
        let batches = self.batches.lock().unwrap();
        match batches.get(batch_id) {
            Some(entry) if !entry.cancel.is_cancelled() => {
                info!(batch = %batch_id, "cancelling batch");
                entry.cancel.cancel();
            }
            Some(_) => debug!(batch = %batch_id, "batch already cancelled"),
            None => debug!(batch = %batch_id, "cancel for unknown batch ignored"),
        }
    }

    /// Cancels every known batch and detaches all subscribers.
    pub fn close(&self) {
        let batches = self.batches.lock().unwrap();
        for (batch_id, entry) in batches.iter() {
            if !entry.cancel.is_cancelled() {
                info!(batch = %batch_id, "cancelling batch on close");
                entry.cancel.cancel();
            }
        }
        drop(batches);
        self.events.close();
    }

    /// Fresh snapshots of interrupted batches, newest first.
    ///
    /// Snapshots older than `snapshot_max_age_hours` are deleted.
    pub fn recoverable_batches(&self) -> Result<Vec<BatchSnapshot>, UploadError> {
        match &self.snapshots {
            Some(store) => recover_fresh(store.as_ref(), self.config.snapshot_max_age()),
            None => Ok(Vec::new()),
        }
    }

    /// Prepares a recovered batch to run again.
    ///
    /// Completed files stay completed; every other file is reset and
    /// re-authorized against its existing record.
    pub async fn resume(&self, batch_id: &str) -> Result<BatchHandle, UploadError> {
        if self.batches.lock().unwrap().contains_key(batch_id) {
            return Err(UploadError::BatchRunning(batch_id.to_string()));
        }
        let store = self
            .snapshots
            .as_ref()
            .ok_or_else(|| UploadError::Snapshot("no snapshot store configured".into()))?;
        let snapshot = store
            .load(batch_id)?
            .ok_or_else(|| UploadError::UnknownBatch(batch_id.to_string()))?;
        if !snapshot.is_fresh(self.config.snapshot_max_age(), Utc::now()) {
            store.remove(batch_id)?;
            return Err(UploadError::Snapshot(format!(
                "snapshot for batch {batch_id} has expired"
            )));
        }

        let BatchSnapshot {
            destination,
            entries,
            ..
        } = snapshot;
        let (files, mut tasks): (Vec<UploadFile>, Vec<FileUploadTask>) = entries
            .into_iter()
            .map(|SnapshotEntry { file, mut task }| {
                if task.status != UploadStatus::Completed {
                    task.reset();
                }
                (file, task)
            })
            .unzip();

        for task in tasks.iter_mut().filter(|t| !t.is_terminal()) {
            if task.record_id.is_none() {
                task.fail("no backend record to resume");
            }
        }

        info!(
            batch = %batch_id,
            files = tasks.len(),
            remaining = tasks.iter().filter(|t| !t.is_terminal()).count(),
            "resuming batch"
        );

        let authorizations = self.authorize_pending(batch_id, &mut tasks).await;
        let prepared = PreparedBatch {
            batch: UploadBatch::new(batch_id.to_string(), tasks, self.monitor.status()),
            files,
            destination,
            authorizations,
        };
        Ok(self.register(prepared))
    }
}
