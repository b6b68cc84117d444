//! Durable batch snapshots for resuming interrupted uploads.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use directup_transfer::FileUploadTask;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::UploadError;
use crate::validation::{DestinationMetadata, UploadFile, validate_file_name};

const SNAPSHOT_EXTENSION: &str = "json";

/// One file of a snapshotted batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub file: UploadFile,
    pub task: FileUploadTask,
}

/// Durable picture of a batch, enough to resume it later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSnapshot {
    pub batch_id: String,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub destination: DestinationMetadata,
    pub entries: Vec<SnapshotEntry>,
}

impl BatchSnapshot {
    /// Whether the snapshot is younger than `max_age` at `now`.
    pub fn is_fresh(&self, max_age: chrono::Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.saved_at) < max_age
    }

    pub fn completed_files(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.task.status == directup_protocol::UploadStatus::Completed)
            .count()
    }
}

/// Persistence for batch snapshots.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: &BatchSnapshot) -> Result<(), UploadError>;

    fn load(&self, batch_id: &str) -> Result<Option<BatchSnapshot>, UploadError>;

    /// Removing a missing snapshot is not an error.
    fn remove(&self, batch_id: &str) -> Result<(), UploadError>;

    fn list(&self) -> Result<Vec<BatchSnapshot>, UploadError>;
}

/// Returns the snapshots younger than `max_age`, deleting the others.
pub fn recover_fresh(
    store: &dyn SnapshotStore,
    max_age: chrono::Duration,
) -> Result<Vec<BatchSnapshot>, UploadError> {
    let now = Utc::now();
    let mut fresh = Vec::new();
    for snapshot in store.list()? {
        if snapshot.is_fresh(max_age, now) {
            fresh.push(snapshot);
        } else {
            info!(
                batch = %snapshot.batch_id,
                saved_at = %snapshot.saved_at,
                "purging stale snapshot"
            );
            store.remove(&snapshot.batch_id)?;
        }
    }
    fresh.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
    Ok(fresh)
}

// ---------------------------------------------------------------------------
// FileSnapshotStore
// ---------------------------------------------------------------------------

/// One JSON file per batch under a directory.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    /// Opens (and creates if needed) the snapshot directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, UploadError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, batch_id: &str) -> Result<PathBuf, UploadError> {
        validate_file_name(batch_id)
            .map_err(|_| UploadError::Snapshot(format!("invalid batch id: {batch_id}")))?;
        Ok(self.dir.join(format!("{batch_id}.{SNAPSHOT_EXTENSION}")))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, snapshot: &BatchSnapshot) -> Result<(), UploadError> {
        let path = self.path_for(&snapshot.batch_id)?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(snapshot)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!(batch = %snapshot.batch_id, path = %path.display(), "snapshot saved");
        Ok(())
    }

    fn load(&self, batch_id: &str) -> Result<Option<BatchSnapshot>, UploadError> {
        let path = self.path_for(batch_id)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, batch_id: &str) -> Result<(), UploadError> {
        let path = self.path_for(batch_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<BatchSnapshot>, UploadError> {
        let mut snapshots = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            let parsed = std::fs::read(&path)
                .map_err(UploadError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<BatchSnapshot>(&bytes)?));
            match parsed {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable snapshot");
                }
            }
        }
        Ok(snapshots)
    }
}

// ---------------------------------------------------------------------------
// MemorySnapshotStore
// ---------------------------------------------------------------------------

/// Process-local store, for callers that do not want crash recovery on disk.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, BatchSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, snapshot: &BatchSnapshot) -> Result<(), UploadError> {
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.batch_id.clone(), snapshot.clone());
        Ok(())
    }

    fn load(&self, batch_id: &str) -> Result<Option<BatchSnapshot>, UploadError> {
        Ok(self.snapshots.lock().unwrap().get(batch_id).cloned())
    }

    fn remove(&self, batch_id: &str) -> Result<(), UploadError> {
        self.snapshots.lock().unwrap().remove(batch_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<BatchSnapshot>, UploadError> {
        Ok(self.snapshots.lock().unwrap().values().cloned().collect())
    }
}
