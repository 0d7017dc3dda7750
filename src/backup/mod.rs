//! Lifecycle of database backups: creation, listing, verification,
//! retention and restore.
//!
//! All of it goes through the [BackupManager]:
//!
//! - [BackupManager::create_backup]: dump into a new uniquely named file.
//! - [BackupManager::list_backups]: recognized dumps, newest first.
//! - [BackupManager::verify_backup]: cheap integrity check, never fails.
//! - [BackupManager::clean_old_backups]: delete backups past their [retention](crate::util::retention).
//! - [BackupManager::restore_from_backup]: feed a dump back into the database.

pub mod dump;
pub mod manifest;
pub mod record;
pub mod upload;

pub use dump::{DumpError, DumpOutput, Dumper, PgDump};
pub use manifest::{Manifest, ManifestEntry};
pub use record::{BackupRecord, InvalidTier, Tier};
pub use upload::{MirrorUploader, UploadError, UploadReceipt, Uploader};

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use derive_more::{Display, Error};
use flate2::read::MultiGzDecoder;

use crate::config::BackupConfig;
use crate::util::retention;

/// Suffix of dumps still being written.
const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Display, Error)]
/// Errors of the backup lifecycle.
pub enum BackupError {
    /// The backup directory can't be created.
    #[display("Unable to create backup directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        source: io::Error,
    },
    /// The dump tool failed.
    #[display("Database dump failed: {_0}")]
    Dump(DumpError),
    /// The restore tool failed.
    #[display("Database restore failed: {_0}")]
    Restore(DumpError),
    /// The finished dump can't be inspected or published.
    #[display("Unable to finalize backup {}: {source}", path.display())]
    Finalize {
        path: PathBuf,
        source: io::Error,
    },
    /// The backup directory can't be read.
    #[display("Unable to read backup directory {}: {source}", path.display())]
    ReadDir {
        path: PathBuf,
        source: io::Error,
    },
    /// There is no backup at the path.
    #[display("Backup not found: {}", _0.display())]
    NotFound(#[error(ignore)] PathBuf),
}

/// Backups with their total size.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackupListing {
    pub backups: Vec<BackupRecord>,
    pub total_size: u64,
}

/// Outcome of a retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub retained: usize,
}

/// Single entry point for the backup lifecycle of one database.
pub struct BackupManager {
    config: BackupConfig,
    dumper: Box<dyn Dumper>,
    uploader: Option<Box<dyn Uploader>>,
    manifest: Manifest,
}

impl BackupManager {
    /// Create a new [BackupManager] dumping with `dumper`.
    pub fn new(config: BackupConfig, dumper: Box<dyn Dumper>) -> Self {
        if config.backup_dir.is_relative() {
            log::warn!(target: "backup::manager", "backup_dir is relative: {}", config.backup_dir.display());
        }
        let manifest = Manifest::in_dir(&config.backup_dir);

        Self {
            config,
            dumper,
            uploader: None,
            manifest,
        }
    }

    /// Create a new [BackupManager] using `pg_dump`/`pg_restore` and the
    /// built-in uploader of the configured remote storage.
    ///
    /// A misconfigured remote storage disables uploads, backups still run.
    pub fn from_config(config: BackupConfig) -> Self {
        let dumper = PgDump::from_config(&config);
        let uploader = upload::uploader_for(&config.remote).unwrap_or_else(|e| {
            log::error!(target: "backup::upload", "{e}, remote upload disabled");
            None
        });

        let mut manager = Self::new(config, Box::new(dumper));
        manager.uploader = uploader;
        manager
    }

    /// Push every new backup through `uploader`.
    pub fn with_uploader(mut self, uploader: Box<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn backup_dir(&self) -> &Path {
        &self.config.backup_dir
    }

    fn ensure_backup_dir(&self) -> Result<(), BackupError> {
        fs::create_dir_all(self.backup_dir()).map_err(|source| BackupError::CreateDir {
            path: self.backup_dir().to_path_buf(),
            source,
        })
    }

    /// Dumps the database into a new backup of the given [Tier].
    ///
    /// The dump is written under a temporary name and only appears under its
    /// final name once complete. A failed upload is logged and ignored.
    pub fn create_backup(&self, tier: Tier) -> Result<BackupRecord, BackupError> {
        self.ensure_backup_dir()?;

        let created = Utc::now();
        let compressed = self.config.compress;
        let filename = record::backup_filename(&self.config.app_name, tier, created, compressed);
        let path = self.backup_dir().join(&filename);
        let partial = self.backup_dir().join(format!("{filename}{PARTIAL_SUFFIX}"));
        log::info!(target: "backup::manager", "Create {tier} backup: {}", path.display());

        if let Err(e) = self.dumper.dump(&partial, compressed) {
            discard_partial(&partial);
            return Err(BackupError::Dump(e));
        }

        let finalize = |source| BackupError::Finalize {
            path: path.clone(),
            source,
        };
        // linking fails on an existing name, a backup is never replaced
        let published = fs::hard_link(&partial, &path);
        discard_partial(&partial);
        if let Err(e) = published {
            if e.kind() == io::ErrorKind::AlreadyExists {
                log::error!(target: "backup::manager", "Refusing to overwrite existing backup {}", path.display());
            }
            return Err(finalize(e));
        }
        let size = fs::metadata(&path).map_err(finalize)?.len();

        let record = BackupRecord {
            filename,
            path: path.clone(),
            size,
            created,
            tier,
            compressed,
        };

        let entry = ManifestEntry {
            tier,
            created,
            size,
            verified: None,
        };
        if let Err(e) = self.manifest.insert(&record.filename, entry) {
            log::warn!(target: "backup::manifest", "Recording {} in the manifest failed: {e}", record.filename);
        }

        self.upload(&record);

        log::info!(target: "backup::manager", "Finished {tier} backup {} ({size} bytes)", record.filename);
        Ok(record)
    }

    fn upload(&self, record: &BackupRecord) {
        if !self.config.remote.enabled {
            return;
        }
        let Some(uploader) = &self.uploader else {
            log::warn!(target: "backup::upload", "Remote storage enabled but no uploader registered, skipping {}", record.filename);
            return;
        };

        match uploader.upload(record) {
            Ok(receipt) => {
                log::info!(target: "backup::upload", "Uploaded {} via {} to {}", record.filename, uploader.name(), receipt.location)
            }
            Err(e) => {
                log::warn!(target: "backup::upload", "Uploading {} via {} failed: {e}", record.filename, uploader.name())
            }
        }
    }

    /// All recognized backups in the backup directory, newest first.
    ///
    /// A missing backup directory holds no backups.
    pub fn list_backups(&self) -> Result<Vec<BackupRecord>, BackupError> {
        let read_dir_err = |source| BackupError::ReadDir {
            path: self.backup_dir().to_path_buf(),
            source,
        };
        let entries = match fs::read_dir(self.backup_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(read_dir_err(e)),
        };
        let manifest = self.manifest.entries();

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(read_dir_err)?;
            let filename = entry.file_name().to_string_lossy().into_owned();
            if !record::is_dump_file(&filename) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!(target: "backup::manager", "Skipping {filename}: {e}");
                    continue;
                }
            };

            let known = manifest.get(&filename);
            let created = known
                .map(|entry| entry.created)
                .or_else(|| record::timestamp_from_filename(&filename))
                .or_else(|| metadata.modified().ok().map(DateTime::<Utc>::from))
                .unwrap_or_else(Utc::now);
            let tier = Tier::from_filename(&filename).unwrap_or(Tier::Manual);

            backups.push(BackupRecord {
                compressed: record::is_compressed(Path::new(&filename)),
                path: entry.path(),
                size: metadata.len(),
                created,
                tier,
                filename,
            });
        }

        backups.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(backups)
    }

    /// [Self::list_backups] along with their aggregate size.
    pub fn listing(&self) -> Result<BackupListing, BackupError> {
        let backups = self.list_backups()?;
        let total_size = backups.iter().map(|backup| backup.size).sum();

        Ok(BackupListing {
            backups,
            total_size,
        })
    }

    /// Returns if the backup at `path` looks usable.
    ///
    /// Missing, unreadable and empty files fail, as do compressed files
    /// whose gzip container is broken. Never returns an error.
    pub fn verify_backup(&self, path: &Path) -> bool {
        let verified = match verify_file(path) {
            Ok(()) => {
                log::info!(target: "backup::manager", "Backup verified: {}", path.display());
                true
            }
            Err(e) => {
                log::warn!(target: "backup::manager", "Backup verification failed for {}: {e}", path.display());
                false
            }
        };

        if let Some(filename) = path.file_name().and_then(|name| name.to_str()) {
            if path.parent() == Some(self.backup_dir()) {
                if let Err(e) = self.manifest.set_verified(filename, verified) {
                    log::debug!(target: "backup::manifest", "Recording verification of {filename} failed: {e}");
                }
            }
        }

        verified
    }

    /// Verifies a backup given by its filename inside the backup directory.
    pub fn verify_named(&self, filename: &str) -> bool {
        if Path::new(filename).file_name().and_then(|n| n.to_str()) != Some(filename) {
            log::warn!(target: "backup::manager", "Refusing to verify backup outside the backup directory: {filename}");
            return false;
        }
        self.verify_backup(&self.backup_dir().join(filename))
    }

    /// Deletes every backup older than the retention of its [Tier].
    ///
    /// Files without a scheduled tier in their name are never touched.
    pub fn clean_old_backups(&self) -> Result<CleanupReport, BackupError> {
        self.clean_old_backups_at(Utc::now())
    }

    /// [Self::clean_old_backups] as if it ran at `now`.
    pub fn clean_old_backups_at(&self, now: DateTime<Utc>) -> Result<CleanupReport, BackupError> {
        let mut report = CleanupReport::default();

        for backup in self.list_backups()? {
            let expired = Tier::from_filename(&backup.filename).is_some_and(|tier| {
                retention::is_expired(&self.config.retention, tier, backup.created, now)
            });
            if !expired {
                report.retained += 1;
                continue;
            }

            let age = retention::age_in_days(backup.created, now);
            match fs::remove_file(&backup.path) {
                Ok(()) => {
                    log::info!(target: "backup::manager", "Deleted {} backup {} ({age} days old)", backup.tier, backup.filename);
                    if let Err(e) = self.manifest.remove(&backup.filename) {
                        log::debug!(target: "backup::manifest", "Removing {} from the manifest failed: {e}", backup.filename);
                    }
                    report.deleted.push(backup.filename);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    log::debug!(target: "backup::manager", "{} vanished before deletion", backup.filename);
                }
                Err(e) => {
                    log::error!(target: "backup::manager", "Deleting {} failed: {e}", backup.filename);
                    report.retained += 1;
                }
            }
        }

        log::info!(target: "backup::manager", "Cleanup finished: {} old backup(s) deleted", report.deleted.len());
        Ok(report)
    }

    /// Restores the database from the dump at `path`.
    pub fn restore_from_backup(&self, path: &Path) -> Result<(), BackupError> {
        if !path.is_file() {
            return Err(BackupError::NotFound(path.to_path_buf()));
        }
        log::warn!(target: "backup::manager", "Restoring database from {}", path.display());

        self.dumper.restore(path).map_err(BackupError::Restore)
    }
}

fn discard_partial(partial: &Path) {
    match fs::remove_file(partial) {
        Ok(()) => {
            log::debug!(target: "backup::manager", "Removed partial dump {}", partial.display())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            log::warn!(target: "backup::manager", "Removing partial dump {} failed: {e}", partial.display())
        }
    }
}

fn verify_file(path: &Path) -> io::Result<()> {
    let metadata = fs::metadata(path)?;
    if !metadata.is_file() {
        return Err(io::Error::other("not a regular file"));
    }
    if metadata.len() == 0 {
        return Err(io::Error::other("file is empty"));
    }

    let mut file = BufReader::new(File::open(path)?);
    if record::is_compressed(path) {
        // decompress the whole container, CRC and length trailers included
        io::copy(&mut MultiGzDecoder::new(file), &mut io::sink())?;
    } else {
        io::copy(&mut file, &mut io::sink())?;
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use chrono::TimeDelta;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    /// [Dumper] writing a fixed payload instead of talking to a database.
    #[derive(Default)]
    pub(crate) struct FakeDumper {
        pub fail: bool,
        pub dumps: AtomicUsize,
        pub restored: Mutex<Vec<PathBuf>>,
    }

    impl FakeDumper {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }
    }

    impl Dumper for FakeDumper {
        fn dump(&self, output: &Path, compress: bool) -> Result<DumpOutput, DumpError> {
            self.dumps.fetch_add(1, Ordering::SeqCst);
            let stream_err = |source| DumpError::Stream {
                program: "fake".into(),
                source,
            };
            // leave a partial file behind like a tool dying mid-dump
            fs::write(output, b"PGDMP partial").map_err(stream_err)?;
            if self.fail {
                return Err(DumpError::Spawn {
                    program: "fake".into(),
                    source: io::Error::new(io::ErrorKind::NotFound, "no such tool"),
                });
            }

            let payload = b"PGDMP fake dump";
            let file = File::create(output).map_err(stream_err)?;
            if compress {
                let mut encoder = GzEncoder::new(file, Compression::default());
                encoder.write_all(payload).map_err(stream_err)?;
                encoder.finish().map_err(stream_err)?;
            } else {
                let mut file = file;
                file.write_all(payload).map_err(stream_err)?;
            }

            Ok(DumpOutput {
                bytes_written: fs::metadata(output).map_err(stream_err)?.len(),
                stderr: String::new(),
            })
        }

        fn restore(&self, input: &Path) -> Result<(), DumpError> {
            self.restored.lock().unwrap().push(input.to_path_buf());
            Ok(())
        }
    }

    struct RecordingUploader {
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    impl Uploader for RecordingUploader {
        fn name(&self) -> &str {
            "recording"
        }

        fn upload(&self, record: &BackupRecord) -> Result<UploadReceipt, UploadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(UploadError::Io(io::Error::other("remote down")));
            }
            Ok(UploadReceipt {
                location: format!("remote://{}", record.filename),
            })
        }
    }

    fn manager(dir: &TempDir, compress: bool) -> BackupManager {
        let mut config = BackupConfig::with_backup_dir(dir.path().join("backups"));
        config.compress = compress;
        BackupManager::new(config, Box::new(FakeDumper::default()))
    }

    fn touch(manager: &BackupManager, tier: &str, created: DateTime<Utc>) -> String {
        fs::create_dir_all(manager.backup_dir()).unwrap();
        let name = format!("app_{tier}_{}.sql", created.format(record::TIMESTAMP_FORMAT));
        fs::write(manager.backup_dir().join(&name), b"data").unwrap();
        name
    }

    #[test]
    fn create_backup_writes_file_and_record() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, false);

        let record = manager.create_backup(Tier::Daily).unwrap();

        assert!(record.size > 0);
        assert!(record.path.is_file());
        assert!(!record.compressed);
        assert!(record.filename.starts_with("app_daily_"));
        assert!(record.filename.ends_with(".sql"));
        assert!(manager.verify_backup(&record.path));
        assert_eq!(
            manager.manifest.get(&record.filename).and_then(|e| e.verified),
            Some(true)
        );
    }

    #[test]
    fn compressed_backup_verifies() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, true);

        let record = manager.create_backup(Tier::Weekly).unwrap();

        assert!(record.compressed);
        assert!(record.filename.ends_with(".sql.gz"));
        assert!(manager.verify_backup(&record.path));
    }

    #[test]
    fn failed_dump_leaves_no_backup_behind() {
        let dir = TempDir::new().unwrap();
        let config = BackupConfig::with_backup_dir(dir.path().join("backups"));
        let manager = BackupManager::new(config, Box::new(FakeDumper::failing()));

        let err = manager.create_backup(Tier::Daily).unwrap_err();

        assert!(matches!(err, BackupError::Dump(DumpError::Spawn { .. })), "{err}");
        assert!(manager.list_backups().unwrap().is_empty());
        let leftovers: Vec<_> = fs::read_dir(manager.backup_dir()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    /// [Dumper] racing another writer to the final backup name.
    struct ClashingDumper;

    impl Dumper for ClashingDumper {
        fn dump(&self, output: &Path, _compress: bool) -> Result<DumpOutput, DumpError> {
            let name = output.to_string_lossy();
            let published = name.trim_end_matches(PARTIAL_SUFFIX);
            fs::write(published, b"earlier backup").unwrap();
            fs::write(output, b"later backup").unwrap();
            Ok(DumpOutput {
                bytes_written: 12,
                stderr: String::new(),
            })
        }

        fn restore(&self, _input: &Path) -> Result<(), DumpError> {
            Ok(())
        }
    }

    #[test]
    fn existing_backup_is_never_overwritten() {
        let dir = TempDir::new().unwrap();
        let config = BackupConfig::with_backup_dir(dir.path().join("backups"));
        let manager = BackupManager::new(config, Box::new(ClashingDumper));

        let err = manager.create_backup(Tier::Manual).unwrap_err();

        match err {
            BackupError::Finalize { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists)
            }
            other => panic!("unexpected error: {other}"),
        }
        let backups = manager.list_backups().unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read(&backups[0].path).unwrap(), b"earlier backup");
        assert!(manager.manifest.get(&backups[0].filename).is_none());
        let files = fs::read_dir(manager.backup_dir()).unwrap().count();
        assert_eq!(files, 1);
    }

    #[test]
    fn backups_in_quick_succession_keep_each_other() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, false);

        let first = manager.create_backup(Tier::Manual).unwrap();
        let second = manager.create_backup(Tier::Manual);

        assert!(first.path.is_file());
        assert_eq!(fs::read(&first.path).unwrap(), b"PGDMP fake dump");
        match second {
            Ok(second) => assert_ne!(first.filename, second.filename),
            Err(e) => assert!(matches!(e, BackupError::Finalize { .. }), "{e}"),
        }
    }

    #[test]
    fn upload_failure_does_not_fail_backup() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut config = BackupConfig::with_backup_dir(dir.path());
        config.remote.enabled = true;
        let manager = BackupManager::new(config, Box::new(FakeDumper::default())).with_uploader(
            Box::new(RecordingUploader {
                fail: true,
                calls: Arc::clone(&calls),
            }),
        );

        let record = manager.create_backup(Tier::Manual).unwrap();

        assert!(record.path.is_file());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn misconfigured_remote_still_backs_up() {
        let dir = TempDir::new().unwrap();
        let mut config = BackupConfig::with_backup_dir(dir.path());
        config.remote.enabled = true;
        config.remote.kind = "mirror".into();
        config.remote.path = None;

        let manager = BackupManager::from_config(config);

        assert!(manager.uploader.is_none());
    }

    #[test]
    fn uploader_is_skipped_while_remote_disabled() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = manager(&dir, false).with_uploader(Box::new(RecordingUploader {
            fail: false,
            calls: Arc::clone(&calls),
        }));

        manager.create_backup(Tier::Daily).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn verify_rejects_missing_empty_and_corrupt_files() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, true);

        assert!(!manager.verify_backup(&dir.path().join("nope.sql")));

        let empty = dir.path().join("empty.sql");
        fs::write(&empty, b"").unwrap();
        assert!(!manager.verify_backup(&empty));

        let corrupt = dir.path().join("corrupt.sql.gz");
        fs::write(&corrupt, b"definitely not gzip").unwrap();
        assert!(!manager.verify_backup(&corrupt));

        let plain = dir.path().join("plain.sql");
        fs::write(&plain, b"data").unwrap();
        assert!(manager.verify_backup(&plain));
    }

    #[test]
    fn truncated_gzip_fails_verification() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, true);
        let record = manager.create_backup(Tier::Daily).unwrap();

        let bytes = fs::read(&record.path).unwrap();
        fs::write(&record.path, &bytes[..bytes.len() - 4]).unwrap();

        assert!(!manager.verify_backup(&record.path));
    }

    #[test]
    fn verify_named_stays_inside_backup_dir() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, false);
        let record = manager.create_backup(Tier::Daily).unwrap();

        assert!(manager.verify_named(&record.filename));
        assert!(!manager.verify_named("../escape.sql"));
    }

    #[test]
    fn listing_is_sorted_newest_first() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, false);
        let now = Utc::now();
        touch(&manager, "daily", now - TimeDelta::days(2));
        touch(&manager, "weekly", now - TimeDelta::days(1));
        touch(&manager, "monthly", now - TimeDelta::days(3));
        fs::write(manager.backup_dir().join("notes.txt"), b"ignored").unwrap();
        fs::write(manager.backup_dir().join("x.sql.partial"), b"ignored").unwrap();

        let listing = manager.listing().unwrap();
        let backups = listing.backups;

        assert_eq!(backups.len(), 3);
        assert!(backups.windows(2).all(|w| w[0].created >= w[1].created));
        assert_eq!(backups[0].tier, Tier::Weekly);
        assert_eq!(listing.total_size, 12);
    }

    #[test]
    fn listing_without_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(manager(&dir, false).list_backups().unwrap().is_empty());
    }

    #[test]
    fn cleanup_respects_daily_boundary() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, false);
        let now = Utc::now();
        let daily = i64::from(manager.config().retention.daily);

        let kept = touch(&manager, "daily", now - TimeDelta::days(daily - 1));
        let expired = touch(&manager, "daily", now - TimeDelta::days(daily + 1));

        let report = manager.clean_old_backups_at(now).unwrap();

        assert_eq!(report.deleted, vec![expired.clone()]);
        assert!(manager.backup_dir().join(kept).exists());
        assert!(!manager.backup_dir().join(expired).exists());
    }

    #[test]
    fn cleanup_counts_partial_days() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, false);
        let now = Utc::now();
        let daily = TimeDelta::days(i64::from(manager.config().retention.daily));

        let kept = touch(&manager, "daily", now - daily + TimeDelta::hours(1));
        let expired = touch(&manager, "daily", now - daily - TimeDelta::hours(23));

        let report = manager.clean_old_backups_at(now).unwrap();

        assert_eq!(report.deleted, vec![expired]);
        assert_eq!(report.retained, 1);
        assert!(manager.backup_dir().join(kept).exists());
    }

    #[test]
    fn cleanup_applies_tier_thresholds() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, false);
        let now = Utc::now();

        let weekly_kept = touch(&manager, "weekly", now - TimeDelta::days(27));
        let weekly_gone = touch(&manager, "weekly", now - TimeDelta::days(29));
        let monthly_kept = touch(&manager, "monthly", now - TimeDelta::days(359));
        let monthly_gone = touch(&manager, "monthly", now - TimeDelta::days(361));

        let report = manager.clean_old_backups_at(now).unwrap();

        assert_eq!(report.deleted.len(), 2);
        assert!(report.deleted.contains(&weekly_gone));
        assert!(report.deleted.contains(&monthly_gone));
        assert!(manager.backup_dir().join(weekly_kept).exists());
        assert!(manager.backup_dir().join(monthly_kept).exists());
    }

    #[test]
    fn cleanup_never_touches_untiered_files() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, false);
        let ancient = Utc::now() - TimeDelta::days(5000);

        let manual = touch(&manager, "manual", ancient);
        fs::write(manager.backup_dir().join("hand-made.sql"), b"data").unwrap();

        let report = manager.clean_old_backups_at(Utc::now()).unwrap();

        assert!(report.deleted.is_empty());
        assert_eq!(report.retained, 2);
        assert!(manager.backup_dir().join(manual).exists());
        assert!(manager.backup_dir().join("hand-made.sql").exists());
    }

    #[test]
    fn restore_requires_existing_file() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, false);

        let err = manager
            .restore_from_backup(&dir.path().join("missing.sql"))
            .unwrap_err();
        assert!(matches!(err, BackupError::NotFound(_)));

        let record = manager.create_backup(Tier::Manual).unwrap();
        manager.restore_from_backup(&record.path).unwrap();
    }
}
