//! Best-effort push of finished backups to remote storage.
//!
//! An [Uploader] reports its own outcome. The [BackupManager](super::BackupManager)
//! logs it and never fails a backup because of it.

use std::fs;
use std::io;
use std::path::PathBuf;

use derive_more::{Display, Error, From};

use super::BackupRecord;
use crate::config::RemoteStorageConfig;

/// Where an uploaded backup ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub location: String,
}

#[derive(Debug, Display, Error, From)]
pub enum UploadError {
    #[display("Upload failed: {_0}")]
    Io(io::Error),
    #[display("Remote storage is misconfigured: {_0}")]
    #[from(ignore)]
    Misconfigured(#[error(ignore)] String),
}

/// Post-backup hook pushing a backup to remote storage.
pub trait Uploader: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn upload(&self, record: &BackupRecord) -> Result<UploadReceipt, UploadError>;
}

/// Copies backups into a second directory, e.g. a network mount.
#[derive(Debug, Clone)]
pub struct MirrorUploader {
    destination: PathBuf,
}

impl MirrorUploader {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
        }
    }
}

impl Uploader for MirrorUploader {
    fn name(&self) -> &str {
        "mirror"
    }

    fn upload(&self, record: &BackupRecord) -> Result<UploadReceipt, UploadError> {
        fs::create_dir_all(&self.destination)?;
        let target = self.destination.join(&record.filename);
        let partial = self.destination.join(format!("{}.partial", record.filename));

        fs::copy(&record.path, &partial)?;
        fs::rename(&partial, &target)?;

        Ok(UploadReceipt {
            location: target.display().to_string(),
        })
    }
}

/// The built-in [Uploader] for the configured remote type, if there is one.
pub fn uploader_for(cfg: &RemoteStorageConfig) -> Result<Option<Box<dyn Uploader>>, UploadError> {
    if !cfg.enabled {
        return Ok(None);
    }

    match cfg.kind.as_str() {
        "mirror" => {
            let path = cfg.path.clone().ok_or_else(|| {
                UploadError::Misconfigured("remote type `mirror` requires BACKUP_REMOTE_PATH".into())
            })?;
            Ok(Some(Box::new(MirrorUploader::new(path))))
        }
        other => {
            log::warn!(target: "backup::upload", "No uploader available for remote type '{other}', remote upload disabled");
            Ok(None)
        }
    }
}
