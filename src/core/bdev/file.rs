use super::sync_status::SyncStatus;
use crate::core::errors::{GanetiError, Result};
use tokio::fs::OpenOptions;
use tracing::info;

/// A file-backed disk (disk_template `file`/`shared-file`).
#[derive(Debug, Clone)]
pub struct FileDisk {
    pub path: String,
    pub size_mib: u64,
    pub attached: bool,
}

impl FileDisk {
    pub fn from_descriptor(path: impl Into<String>, size_mib: u64) -> Self {
        Self {
            path: path.into(),
            size_mib,
            attached: false,
        }
    }

    pub async fn attach(&mut self) -> Result<bool> {
        let exists = tokio::fs::metadata(&self.path).await.is_ok();
        self.attached = exists;
        Ok(exists)
    }

    /// Creates and truncates to the requested size; refuses if the file
    /// already exists (§4.2).
    pub async fn create(&mut self) -> Result<()> {
        if tokio::fs::metadata(&self.path).await.is_ok() {
            return Err(GanetiError::AlreadyExists(format!(
                "file disk '{}' already exists",
                self.path
            )));
        }
        if let Some(parent) = std::path::Path::new(&self.path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await?;
        file.set_len(self.size_mib * 1024 * 1024).await?;
        info!(path = %self.path, size_mib = self.size_mib, "created file-backed disk");
        self.attached = true;
        Ok(())
    }

    /// Assemble just asserts existence (§4.2).
    pub async fn assemble(&mut self) -> Result<()> {
        if !self.attach().await? {
            return Err(GanetiError::BlockDeviceError(format!(
                "file disk '{}' does not exist",
                self.path
            )));
        }
        Ok(())
    }

    pub async fn remove(&mut self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.attached = false;
        Ok(())
    }

    pub async fn grow(&mut self, amount_mib: u64) -> Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path).await?;
        self.size_mib += amount_mib;
        file.set_len(self.size_mib * 1024 * 1024).await?;
        Ok(())
    }

    pub fn get_size(&self) -> Option<u64> {
        if self.attached { Some(self.size_mib) } else { None }
    }

    pub fn sync_status(&self) -> SyncStatus {
        SyncStatus {
            percent: None,
            eta_seconds: None,
            degraded: false,
            ldisk: !self.attached,
        }
    }
}
