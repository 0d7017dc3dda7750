//! Sidecar metadata of the backups in a backup directory.
//!
//! The manifest is a best-effort record: a missing or unreadable manifest
//! only means the metadata falls back to what the filenames tell.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::Tier;

pub const MANIFEST_FILENAME: &str = ".manifest.json";

/// Metadata of a single backup.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "type")]
    pub tier: Tier,
    pub created: DateTime<Utc>,
    pub size: u64,
    /// Outcome of the latest verification, [None] if never verified.
    pub verified: Option<bool>,
}

/// JSON file mapping filenames to [ManifestEntry]s.
#[derive(Debug)]
pub struct Manifest {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Manifest {
    pub fn in_dir(backup_dir: &Path) -> Self {
        Self {
            path: backup_dir.join(MANIFEST_FILENAME),
            lock: Mutex::new(()),
        }
    }

    /// All entries, empty if the manifest doesn't exist or is unreadable.
    pub fn entries(&self) -> BTreeMap<String, ManifestEntry> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.load()
    }

    pub fn get(&self, filename: &str) -> Option<ManifestEntry> {
        self.entries().remove(filename)
    }

    pub fn insert(&self, filename: &str, entry: ManifestEntry) -> io::Result<()> {
        self.update(|entries| {
            entries.insert(filename.to_string(), entry);
        })
    }

    /// Records the verification outcome of a known backup.
    pub fn set_verified(&self, filename: &str, verified: bool) -> io::Result<()> {
        self.update(|entries| {
            if let Some(entry) = entries.get_mut(filename) {
                entry.verified = Some(verified);
            }
        })
    }

    pub fn remove(&self, filename: &str) -> io::Result<()> {
        self.update(|entries| {
            entries.remove(filename);
        })
    }

    fn update(&self, change: impl FnOnce(&mut BTreeMap<String, ManifestEntry>)) -> io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries = self.load();
        change(&mut entries);

        let json = serde_json::to_vec_pretty(&entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)
    }

    fn load(&self) -> BTreeMap<String, ManifestEntry> {
        match fs::read(&self.path) {
            Ok(content) => serde_json::from_slice(&content).unwrap_or_else(|e| {
                log::warn!(target: "backup::manifest", "Ignoring unreadable manifest {}: {e}", self.path.display());
                BTreeMap::new()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                log::warn!(target: "backup::manifest", "Reading manifest {} failed: {e}", self.path.display());
                BTreeMap::new()
            }
        }
    }
}
