//! Batch input checks run before any network call.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use directup_protocol::PendingRecord;
use serde::{Deserialize, Serialize};

use crate::error::UploadError;

/// A local file offered for upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFile {
    pub path: PathBuf,
    /// Name the object is registered under.
    pub file_name: String,
    pub size_bytes: u64,
    pub content_type: String,
    /// Per-file fields; override destination fields with the same key.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl UploadFile {
    pub fn new(
        path: impl Into<PathBuf>,
        file_name: impl Into<String>,
        size_bytes: u64,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            file_name: file_name.into(),
            size_bytes,
            content_type: content_type.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Describes a file on disk, detecting its content type by extension.
    pub async fn from_path(path: impl Into<PathBuf>) -> Result<Self, UploadError> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(UploadError::Validation(format!(
                "not a regular file: {}",
                path.display()
            )));
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let content_type = detect_content_type(&path)
            .unwrap_or("application/octet-stream")
            .to_string();
        Ok(Self::new(path, file_name, metadata.len(), content_type))
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Fields shared by every file of a batch (album, project, owner, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationMetadata {
    pub fields: BTreeMap<String, String>,
}

impl DestinationMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Destination fields overlaid with the file's own metadata.
    pub fn merged_with(&self, file: &UploadFile) -> BTreeMap<String, String> {
        let mut merged = self.fields.clone();
        merged.extend(file.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

/// Detects a MIME type from the file extension.
pub fn detect_content_type(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    match ext.as_deref() {
        Some("mp4" | "m4v") => Some("video/mp4"),
        Some("mov") => Some("video/quicktime"),
        Some("mkv") => Some("video/x-matroska"),
        Some("webm") => Some("video/webm"),
        Some("avi") => Some("video/x-msvideo"),
        Some("png") => Some("image/png"),
        Some("jpg" | "jpeg") => Some("image/jpeg"),
        Some("webp") => Some("image/webp"),
        Some("gif") => Some("image/gif"),
        Some("heic") => Some("image/heic"),
        Some("mp3") => Some("audio/mpeg"),
        Some("wav") => Some("audio/wav"),
        Some("pdf") => Some("application/pdf"),
        Some("zip") => Some("application/zip"),
        _ => None,
    }
}

/// Checks that a file name is a single safe path component.
///
/// Rejects empty names, separators, parent traversal and absolute paths.
pub fn validate_file_name(name: &str) -> Result<(), UploadError> {
    match file_name_problem(name) {
        Some(problem) => Err(UploadError::Validation(problem)),
        None => Ok(()),
    }
}

fn file_name_problem(name: &str) -> Option<String> {
    if name.trim().is_empty() {
        return Some("empty file name".into());
    }
    if name.contains(['/', '\\', '\0']) {
        return Some(format!("file name must not contain path separators: {name}"));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => None,
        _ => Some(format!("unsafe file name: {name}")),
    }
}

/// Validates a whole batch and builds one pending record per file.
///
/// All problems are collected so the caller sees every bad file at once.
pub fn validate_batch(
    files: &[UploadFile],
    destination: &DestinationMetadata,
    required_fields: &[String],
) -> Result<Vec<PendingRecord>, UploadError> {
    if files.is_empty() {
        return Err(UploadError::Validation("batch contains no files".into()));
    }

    let mut problems = Vec::new();
    let mut records = Vec::with_capacity(files.len());

    for file in files {
        if let Some(problem) = file_name_problem(&file.file_name) {
            problems.push(problem);
            continue;
        }
        if file.size_bytes == 0 {
            problems.push(format!("{}: file is empty", file.file_name));
        }
        if !is_plausible_content_type(&file.content_type) {
            problems.push(format!(
                "{}: invalid content type {:?}",
                file.file_name, file.content_type
            ));
        }

        let metadata = destination.merged_with(file);
        let missing: Vec<&str> = required_fields
            .iter()
            .filter(|field| metadata.get(*field).is_none_or(|v| v.trim().is_empty()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            problems.push(format!(
                "{}: missing required metadata: {}",
                file.file_name,
                missing.join(", ")
            ));
        }

        records.push(PendingRecord {
            file_name: file.file_name.clone(),
            file_size_bytes: file.size_bytes,
            content_type: file.content_type.clone(),
            metadata,
        });
    }

    if !problems.is_empty() {
        return Err(UploadError::Validation(problems.join("; ")));
    }
    Ok(records)
}

fn is_plausible_content_type(content_type: &str) -> bool {
    match content_type.split_once('/') {
        Some((kind, sub)) => {
            !kind.is_empty() && !sub.is_empty() && !content_type.contains(char::is_whitespace)
        }
        None => false,
    }
}
