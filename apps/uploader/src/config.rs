//! Uploader configuration.
//!
//! Stored as TOML:
//! - Linux: `~/.config/directup/uploader.toml`
//! - Windows: `%APPDATA%/directup/uploader.toml`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use directup_transfer::{ContentHasher, Md5Hasher, Sha256Hasher};
use directup_upload::UploadConfig;
use serde::{Deserialize, Serialize};

/// Integrity header sent with each object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HasherKind {
    #[default]
    Md5,
    Sha256,
}

impl HasherKind {
    pub fn build(self) -> Arc<dyn ContentHasher> {
        match self {
            Self::Md5 => Arc::new(Md5Hasher),
            Self::Sha256 => Arc::new(Sha256Hasher),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Base URL of the records API.
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Bearer token for the records API. Empty means anonymous.
    #[serde(default)]
    pub api_token: String,

    /// Metadata keys every file must carry.
    #[serde(default)]
    pub required_fields: Vec<String>,

    #[serde(default)]
    pub hasher: HasherKind,

    /// Where interrupted batches are kept; next to the config file when empty.
    #[serde(default)]
    pub snapshot_dir: String,

    #[serde(default)]
    pub upload: UploadConfig,
}

fn default_backend_url() -> String {
    "http://127.0.0.1:8080/api".into()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            api_token: String::new(),
            required_fields: Vec::new(),
            hasher: HasherKind::default(),
            snapshot_dir: String::new(),
            upload: UploadConfig::default(),
        }
    }
}

impl CliConfig {
    /// Loads configuration from `path` (or the default location), creating
    /// a default file if none exists.
    pub fn load(path: Option<&Path>) -> anyhow::Result<(Self, PathBuf)> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path(),
        };

        let config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            let config = CliConfig::default();
            config.save(&path)?;
            tracing::info!(path = %path.display(), "wrote default configuration");
            config
        };

        config.upload.validate()?;
        Ok((config, path))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // May contain the API token.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Resolves the snapshot directory against the config file location.
    pub fn snapshot_dir(&self, config_file: &Path) -> PathBuf {
        if !self.snapshot_dir.is_empty() {
            return PathBuf::from(&self.snapshot_dir);
        }
        config_file
            .parent()
            .map(|p| p.join("snapshots"))
            .unwrap_or_else(|| PathBuf::from("snapshots"))
    }

    pub fn api_token(&self) -> Option<&str> {
        (!self.api_token.is_empty()).then_some(self.api_token.as_str())
    }
}

/// Platform-specific configuration file path.
fn config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("directup").join("uploader.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("directup")
            .join("uploader.toml")
    }
}
