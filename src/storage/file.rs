// src/storage/file.rs

use crate::error::{AppError, Result};
use crate::storage::{PoolSnapshot, PoolStore};
use async_trait::async_trait;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, error, info, warn};

/// JSON pool file with crash-safe replacement.
///
/// Every save writes `<file>.tmp`, reads it back and compares it byte for byte,
/// copies the current file to `<file>.bak` and finally renames the temp file
/// over the original. A crash at any point leaves either the old or the new
/// file in place.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    attempts: u32,
    retry_delay: Duration,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_retries(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn temp_path(&self) -> PathBuf {
        sibling(&self.path, "tmp")
    }

    pub fn backup_path(&self) -> PathBuf {
        sibling(&self.path, "bak")
    }

    async fn write_once(&self, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.temp_path();
        fs::write(&tmp, bytes).await?;

        let written = fs::read(&tmp).await?;
        if written != bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "temp file content differs from the serialized snapshot",
            ));
        }

        if fs::try_exists(&self.path).await? {
            fs::copy(&self.path, self.backup_path()).await?;
        }
        fs::rename(&tmp, &self.path).await
    }

    async fn read_snapshot(path: &Path) -> io::Result<Option<PoolSnapshot>> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl PoolStore for JsonFileStore {
    async fn load(&self) -> Result<Option<PoolSnapshot>> {
        match Self::read_snapshot(&self.path).await {
            Ok(snapshot) => Ok(snapshot),
            Err(primary) => {
                warn!(
                    storage.path = %self.path.display(),
                    error = %primary,
                    "Pool file unreadable, trying backup"
                );
                match Self::read_snapshot(&self.backup_path()).await {
                    Ok(Some(snapshot)) => {
                        info!(
                            storage.backup = %self.backup_path().display(),
                            keys = snapshot.keys.len(),
                            "Recovered key pool from backup"
                        );
                        Ok(Some(snapshot))
                    }
                    Ok(None) | Err(_) => Err(AppError::Persistence {
                        path: self.location(),
                        attempts: 1,
                        message: format!("pool file is corrupt and no usable backup exists: {primary}"),
                    }),
                }
            }
        }
    }

    async fn save(&self, snapshot: &PoolSnapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            match self.write_once(&bytes).await {
                Ok(()) => {
                    debug!(
                        storage.path = %self.path.display(),
                        bytes = bytes.len(),
                        attempt,
                        "Key pool saved"
                    );
                    return Ok(());
                }
                Err(e) => {
                    let _ = fs::remove_file(self.temp_path()).await;
                    warn!(
                        storage.path = %self.path.display(),
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Key pool save attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        let message = last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string());
        error!(
            storage.path = %self.path.display(),
            attempts = self.attempts,
            error = %message,
            "Giving up on key pool save"
        );
        Err(AppError::Persistence {
            path: self.location(),
            attempts: self.attempts,
            message,
        })
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
