//! Backup tiers, records and the on-disk naming convention.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use clap::ValueEnum;
use derive_more::{Display, Error};
use regex::Regex;

/// Timestamp layout embedded in every backup filename.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Extension of an uncompressed dump.
pub const DUMP_EXTENSION: &str = ".sql";

/// Extension of a gzip compressed dump.
pub const COMPRESSED_DUMP_EXTENSION: &str = ".sql.gz";

static FILENAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<app>.+)_(?P<tier>daily|weekly|monthly|manual)_(?P<ts>\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2})\.sql(?P<gz>\.gz)?$",
    )
    .expect("filename pattern should be a valid regex")
});

/// Tier of a backup, deciding its retention and schedule.
#[derive(
    Copy,
    Clone,
    Debug,
    Display,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    ValueEnum,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[display("daily")]
    Daily,
    #[display("weekly")]
    Weekly,
    #[display("monthly")]
    Monthly,
    /// Created on demand, never removed by retention.
    #[display("manual")]
    Manual,
}

impl Tier {
    /// Tiers driven by a cron schedule.
    pub const SCHEDULED: [Tier; 3] = [Tier::Daily, Tier::Weekly, Tier::Monthly];

    /// Recovers the tier from a filename by substring match.
    ///
    /// Returns [None] for names carrying none of the scheduled tier markers,
    /// which makes them manual backups as far as retention is concerned.
    pub fn from_filename(filename: &str) -> Option<Tier> {
        Self::SCHEDULED
            .into_iter()
            .find(|tier| filename.contains(&format!("_{tier}_")))
    }
}

/// The given name is not a known [Tier].
#[derive(Debug, Display, Error, PartialEq, Eq)]
#[display("Invalid backup type: {_0} (expected daily, weekly, monthly or manual)")]
pub struct InvalidTier(#[error(ignore)] pub String);

impl FromStr for Tier {
    type Err = InvalidTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "manual" => Ok(Self::Manual),
            other => Err(InvalidTier(other.to_string())),
        }
    }
}

/// A dump file living in the backup directory.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BackupRecord {
    pub filename: String,
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    pub created: DateTime<Utc>,
    #[serde(rename = "type")]
    pub tier: Tier,
    pub compressed: bool,
}

/// Generates `<app>_<tier>_<YYYY-MM-DD_HH-mm-ss>.sql[.gz]`.
pub fn backup_filename(app: &str, tier: Tier, at: DateTime<Utc>, compressed: bool) -> String {
    let timestamp = at.format(TIMESTAMP_FORMAT);
    let extension = if compressed {
        COMPRESSED_DUMP_EXTENSION
    } else {
        DUMP_EXTENSION
    };

    format!("{app}_{tier}_{timestamp}{extension}")
}

/// Whether the filename has one of the recognized dump extensions.
pub fn is_dump_file(filename: &str) -> bool {
    filename.ends_with(DUMP_EXTENSION) || filename.ends_with(COMPRESSED_DUMP_EXTENSION)
}

/// Whether the path points to a gzip compressed dump.
pub fn is_compressed(path: &Path) -> bool {
    path.to_string_lossy().ends_with(".gz")
}

/// Creation time encoded in a filename following [backup_filename].
pub fn timestamp_from_filename(filename: &str) -> Option<DateTime<Utc>> {
    let captures = FILENAME_RE.captures(filename)?;
    let timestamp = NaiveDateTime::parse_from_str(&captures["ts"], TIMESTAMP_FORMAT).ok()?;

    Some(timestamp.and_utc())
}
