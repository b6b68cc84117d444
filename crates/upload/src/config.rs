//! Upload tuning knobs, loaded from TOML.
//!
//! Every field has a default, so an empty document is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::UploadError;

/// Floor for the per-transfer timeout.
pub const MIN_TRANSFER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Lower and upper bound of the derived concurrency.
const MIN_DERIVED_CONCURRENCY: usize = 2;
const MAX_DERIVED_CONCURRENCY: usize = 5;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Upload pipeline configuration.
///
/// Every field has a default, so a partial TOML table is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Max files per authorization request.
    pub batch_size: usize,
    /// Parallel transfers; derived from the batch shape when unset.
    pub concurrency: Option<usize>,
    pub retry_attempts: u32,
    pub retry_delay_base_ms: u64,
    pub retry_delay_max_ms: u64,
    pub timeout_per_megabyte_ms: u64,
    pub stall_threshold_seconds: u64,
    /// Reserved for chunked transfer.
    pub chunk_size: u64,
    /// Measured throughput below this marks the network slow.
    pub slow_threshold_bps: f64,
    pub authorization_expiration_hours: u32,
    pub snapshot_max_age_hours: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            concurrency: None,
            retry_attempts: 3,
            retry_delay_base_ms: 1000,
            retry_delay_max_ms: 30_000,
            timeout_per_megabyte_ms: 120_000,
            stall_threshold_seconds: 30,
            chunk_size: 8 * MIB,
            slow_threshold_bps: 100.0 * 1024.0,
            authorization_expiration_hours: 1,
            snapshot_max_age_hours: 24,
        }
    }
}

impl UploadConfig {
    /// Parses a TOML document, filling missing fields with defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, UploadError> {
        let config: Self = toml::from_str(s).map_err(|e| UploadError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, UploadError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.batch_size == 0 {
            return Err(UploadError::Config("batch_size must be at least 1".into()));
        }
        if self.concurrency == Some(0) {
            return Err(UploadError::Config("concurrency must be at least 1".into()));
        }
        if self.retry_delay_base_ms == 0 {
            return Err(UploadError::Config(
                "retry_delay_base_ms must be positive".into(),
            ));
        }
        if self.retry_delay_max_ms < self.retry_delay_base_ms {
            return Err(UploadError::Config(format!(
                "retry_delay_max_ms ({}) is below retry_delay_base_ms ({})",
                self.retry_delay_max_ms, self.retry_delay_base_ms
            )));
        }
        if self.stall_threshold_seconds == 0 {
            return Err(UploadError::Config(
                "stall_threshold_seconds must be positive".into(),
            ));
        }
        if !self.slow_threshold_bps.is_finite() || self.slow_threshold_bps < 0.0 {
            return Err(UploadError::Config(
                "slow_threshold_bps must be a non-negative number".into(),
            ));
        }
        if self.authorization_expiration_hours == 0 {
            return Err(UploadError::Config(
                "authorization_expiration_hours must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_delay_base(&self) -> Duration {
        Duration::from_millis(self.retry_delay_base_ms)
    }

    pub fn retry_delay_max(&self) -> Duration {
        Duration::from_millis(self.retry_delay_max_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_seconds)
    }

    pub fn snapshot_max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.snapshot_max_age_hours))
    }

    /// Timeout for one transfer attempt of `size_bytes`.
    pub fn transfer_timeout(&self, size_bytes: u64) -> Duration {
        let megabytes = size_bytes as f64 / MIB as f64;
        let per_megabyte = self.timeout_per_megabyte_ms as f64 / 1000.0;
        let scaled = Duration::from_secs_f64(megabytes * per_megabyte);
        scaled.max(MIN_TRANSFER_TIMEOUT)
    }

    /// Pool size for a batch, honoring an explicit `concurrency`.
    pub fn effective_concurrency(&self, total_files: usize, total_bytes: u64) -> usize {
        match self.concurrency {
            Some(n) => n.max(1),
            None => derive_concurrency(total_files, total_bytes),
        }
    }
}

/// Picks a pool size from the number of files and their average size.
pub fn derive_concurrency(total_files: usize, total_bytes: u64) -> usize {
    let mut lanes = match total_files {
        0..=5 => 5,
        6..=20 => 4,
        _ => 3,
    };

    if total_files > 0 {
        let average = total_bytes / total_files as u64;
        if average >= GIB {
            lanes = lanes.min(2);
        } else if average >= 500 * MIB {
            lanes = lanes.min(3);
        }
    }

    lanes.clamp(MIN_DERIVED_CONCURRENCY, MAX_DERIVED_CONCURRENCY)
}
