//! Node configuration file
//!
//! `sftp.json` lives in the product config directory (`~/.oxideterm`, or
//! `%APPDATA%\OxideTerm` on Windows). Writes go through a sibling temp file
//! and a rename so a crash never leaves a half-written file behind.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use super::types::{ConfigFile, CONFIG_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Could not locate a home or config directory")]
    NoConfigDir,

    #[error("Config I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("OxideTerm"));
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".oxideterm"))
        .ok_or(StorageError::NoConfigDir)
}

pub fn sftp_config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("sftp.json"))
}

/// Reads and writes one [`ConfigFile`]
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Storage at the default [`sftp_config_file`] location
    pub fn new() -> Result<Self, StorageError> {
        sftp_config_file().map(Self::with_path)
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Load the file.
    ///
    /// A missing file yields defaults. An unparsable file is copied aside
    /// (see [`Self::backup`]) and also yields defaults; a file written by a
    /// newer version is refused so it does not get overwritten.
    pub async fn load(&self) -> Result<ConfigFile, StorageError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {:?}, using defaults", self.path);
                return Ok(ConfigFile::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config = match serde_json::from_str::<ConfigFile>(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!("Config at {:?} is unreadable: {}", self.path, e);
                match self.backup().await {
                    Ok(copy) => warn!("Kept unreadable config as {:?}", copy),
                    Err(backup_err) => error!("Could not back up unreadable config: {}", backup_err),
                }
                return Ok(ConfigFile::default());
            }
        };

        if config.version > CONFIG_VERSION {
            return Err(StorageError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }
        Ok(config)
    }

    pub async fn save(&self, config: &ConfigFile) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let json = serde_json::to_vec_pretty(config)?;
        let staging = self.path.with_extension("json.tmp");

        let mut file = fs::File::create(&staging).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&staging, &self.path).await?;
        debug!("Saved config to {:?}", self.path);
        Ok(())
    }

    /// Copy the current file to a timestamped sibling and return its path.
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let copy = self.path.with_extension(format!("json.backup.{}", stamp));

        if self.exists().await {
            fs::copy(&self.path, &copy).await?;
        }
        Ok(copy)
    }
}
