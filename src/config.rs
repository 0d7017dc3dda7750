//! Process wide settings, read once from the environment.
//!
//! Every field maps to an environment variable; flags of the same name
//! may override them on the command line.

use std::convert::Infallible;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser};

use crate::backup::Tier;
use crate::util::retention::RetentionConfig;

const REDACTED: &str = "********";

/// A credential that never shows up in logs or serialized configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The secret in clear text.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl FromStr for Secret {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl serde::Serialize for Secret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

/// Connection parameters of the database to dump.
#[derive(Clone, Debug, Args, serde::Serialize)]
pub struct DatabaseConfig {
    /// Database server host.
    #[arg(long = "db-host", env = "DB_HOST", default_value = "localhost")]
    pub host: String,

    /// Database server port.
    #[arg(long = "db-port", env = "DB_PORT", default_value_t = 5432)]
    pub port: u16,

    /// Name of the database to back up.
    #[arg(long = "db-name", env = "DB_NAME", default_value = "postgres")]
    pub name: String,

    /// Role used to connect.
    #[arg(long = "db-user", env = "DB_USER", default_value = "postgres")]
    pub user: String,

    /// Password of the role.
    #[arg(long = "db-password", env = "DB_PASSWORD", hide_env_values = true)]
    pub password: Option<Secret>,
}

impl DatabaseConfig {
    /// Environment handed to the native tools.
    ///
    /// Credentials travel this way so they never appear in process listings.
    pub fn env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("PGHOST", self.host.clone()),
            ("PGPORT", self.port.to_string()),
            ("PGDATABASE", self.name.clone()),
            ("PGUSER", self.user.clone()),
        ];
        if let Some(password) = &self.password {
            env.push(("PGPASSWORD", password.expose().to_string()));
        }

        env
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            name: "postgres".into(),
            user: "postgres".into(),
            password: None,
        }
    }
}

/// Settings of the best-effort push to remote storage.
#[derive(Clone, Debug, Default, Args, serde::Serialize)]
pub struct RemoteStorageConfig {
    /// Push every new backup to remote storage.
    #[arg(
        long = "remote-enabled",
        env = "BACKUP_REMOTE_ENABLED",
        default_value = "false",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
    )]
    pub enabled: bool,

    /// Kind of remote storage, e.g. `mirror` or `s3`.
    #[arg(long = "remote-type", env = "BACKUP_REMOTE_TYPE", default_value = "mirror")]
    pub kind: String,

    /// Bucket of object storage remotes.
    #[arg(long = "remote-bucket", env = "BACKUP_REMOTE_BUCKET")]
    pub bucket: Option<String>,

    /// Region of object storage remotes.
    #[arg(long = "remote-region", env = "BACKUP_REMOTE_REGION")]
    pub region: Option<String>,

    /// Access key of object storage remotes.
    #[arg(long = "remote-access-key", env = "BACKUP_REMOTE_ACCESS_KEY", hide_env_values = true)]
    pub access_key: Option<Secret>,

    /// Secret key of object storage remotes.
    #[arg(long = "remote-secret-key", env = "BACKUP_REMOTE_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<Secret>,

    /// Destination directory of the `mirror` remote.
    #[arg(long = "remote-path", env = "BACKUP_REMOTE_PATH")]
    pub path: Option<PathBuf>,
}

/// Configuration of the backup manager.
#[derive(Clone, Debug, Args, serde::Serialize)]
pub struct BackupConfig {
    #[command(flatten)]
    pub database: DatabaseConfig,

    /// Prefix of every backup filename.
    #[arg(long = "app-name", env = "BACKUP_APP_NAME", default_value = "app")]
    pub app_name: String,

    /// Folder holding the dumps.
    #[arg(long = "backup-dir", env = "BACKUP_DIR", default_value = "./backups")]
    pub backup_dir: PathBuf,

    #[command(flatten)]
    pub retention: RetentionConfig,

    /// Gzip dumps on the fly.
    #[arg(
        long = "compress",
        env = "BACKUP_COMPRESS",
        default_value = "true",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
    )]
    pub compress: bool,

    /// Encrypt dumps. Accepted but not implemented.
    #[arg(
        long = "encrypt",
        env = "BACKUP_ENCRYPT",
        default_value = "false",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
    )]
    pub encrypt: bool,

    /// Key for encrypted dumps. Accepted but not implemented.
    #[arg(long = "encryption-key", env = "BACKUP_ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: Option<Secret>,

    #[command(flatten)]
    pub remote: RemoteStorageConfig,

    /// Seconds after which a dump or restore is killed. `0` waits forever.
    #[arg(long = "dump-timeout", env = "BACKUP_DUMP_TIMEOUT_SECS", default_value_t = 3600)]
    pub dump_timeout_secs: u64,

    /// Native export tool.
    #[arg(long = "pg-dump", env = "PG_DUMP_PATH", default_value = "pg_dump")]
    pub pg_dump: PathBuf,

    /// Native restore tool.
    #[arg(long = "pg-restore", env = "PG_RESTORE_PATH", default_value = "pg_restore")]
    pub pg_restore: PathBuf,
}

impl BackupConfig {
    /// A configuration with defaults for everything but the backup directory.
    pub fn with_backup_dir(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            database: DatabaseConfig::default(),
            app_name: "app".into(),
            backup_dir: backup_dir.into(),
            retention: RetentionConfig::default(),
            compress: true,
            encrypt: false,
            encryption_key: None,
            remote: RemoteStorageConfig::default(),
            dump_timeout_secs: 3600,
            pg_dump: "pg_dump".into(),
            pg_restore: "pg_restore".into(),
        }
    }

    /// Bound on a single dump or restore, if any.
    pub fn dump_timeout(&self) -> Option<Duration> {
        (self.dump_timeout_secs > 0).then(|| Duration::from_secs(self.dump_timeout_secs))
    }
}

/// Cron bindings of the scheduled tiers.
#[derive(Clone, Debug, Args, serde::Serialize)]
pub struct ScheduleConfig {
    /// Cron expression of the daily backup.
    #[arg(id = "schedule-daily", long = "schedule-daily", env = "BACKUP_SCHEDULE_DAILY", default_value = "0 2 * * *")]
    pub daily: String,

    /// Cron expression of the weekly backup.
    #[arg(id = "schedule-weekly", long = "schedule-weekly", env = "BACKUP_SCHEDULE_WEEKLY", default_value = "0 3 * * 0")]
    pub weekly: String,

    /// Cron expression of the monthly backup.
    #[arg(id = "schedule-monthly", long = "schedule-monthly", env = "BACKUP_SCHEDULE_MONTHLY", default_value = "0 4 1 * *")]
    pub monthly: String,

    #[arg(
        long = "daily-enabled",
        env = "BACKUP_DAILY_ENABLED",
        default_value = "true",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
    )]
    pub daily_enabled: bool,

    #[arg(
        long = "weekly-enabled",
        env = "BACKUP_WEEKLY_ENABLED",
        default_value = "true",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
    )]
    pub weekly_enabled: bool,

    #[arg(
        long = "monthly-enabled",
        env = "BACKUP_MONTHLY_ENABLED",
        default_value = "true",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
    )]
    pub monthly_enabled: bool,

    /// IANA time zone the cron expressions are evaluated in.
    #[arg(long = "timezone", env = "BACKUP_TIMEZONE", default_value = "UTC")]
    pub timezone: String,

    /// Seconds between scheduler start and the first health check.
    #[arg(long = "health-check-delay", env = "BACKUP_HEALTH_CHECK_DELAY_SECS", default_value_t = 5)]
    pub health_check_delay_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily: "0 2 * * *".into(),
            weekly: "0 3 * * 0".into(),
            monthly: "0 4 1 * *".into(),
            daily_enabled: true,
            weekly_enabled: true,
            monthly_enabled: true,
            timezone: "UTC".into(),
            health_check_delay_secs: 5,
        }
    }
}

/// One scheduled tier with its cron expression.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ScheduleDefinition {
    pub tier: Tier,
    pub expression: String,
    pub enabled: bool,
}

impl ScheduleConfig {
    /// The schedule of every tier driven by cron, in [Tier::SCHEDULED] order.
    pub fn definitions(&self) -> Vec<ScheduleDefinition> {
        Tier::SCHEDULED
            .into_iter()
            .filter_map(|tier| {
                let (expression, enabled) = match tier {
                    Tier::Daily => (&self.daily, self.daily_enabled),
                    Tier::Weekly => (&self.weekly, self.weekly_enabled),
                    Tier::Monthly => (&self.monthly, self.monthly_enabled),
                    Tier::Manual => return None,
                };
                Some(ScheduleDefinition {
                    tier,
                    expression: expression.clone(),
                    enabled,
                })
            })
            .collect()
    }
}

/// Where failures of scheduled backups are reported.
#[derive(Clone, Debug, Default, Args, serde::Serialize)]
pub struct AlertConfig {
    /// Webhook receiving a JSON alert for every failed scheduled backup.
    #[arg(long = "webhook-url", env = "BACKUP_WEBHOOK_URL")]
    pub webhook_url: Option<String>,
}

/// Everything the backup tools are configured with.
#[derive(Clone, Debug, Args, serde::Serialize)]
pub struct Settings {
    #[command(flatten)]
    pub backup: BackupConfig,

    #[command(flatten)]
    pub schedule: ScheduleConfig,

    #[command(flatten)]
    pub alert: AlertConfig,
}

#[derive(Parser)]
#[command(no_binary_name = true)]
struct EnvOnly {
    #[command(flatten)]
    settings: Settings,
}

impl Settings {
    /// Reads the settings from the environment only.
    pub fn from_env() -> Result<Self, clap::Error> {
        let settings = EnvOnly::try_parse_from(std::iter::empty::<String>())?.settings;
        settings.warn_unsupported();

        Ok(settings)
    }

    /// Logs settings that are accepted but have no effect.
    pub fn warn_unsupported(&self) {
        if self.backup.encrypt || self.backup.encryption_key.is_some() {
            log::warn!(target: "config", "Backup encryption is not implemented, dumps are stored unencrypted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        settings: Settings,
    }

    #[test]
    fn flags_override_defaults() {
        let cli = TestCli::try_parse_from([
            "test",
            "--db-password",
            "hunter2",
            "--compress",
            "no",
            "--retention-daily",
            "3",
            "--weekly-enabled",
            "false",
        ])
        .unwrap();
        let settings = cli.settings;

        assert_eq!(settings.backup.database.host, "localhost");
        assert_eq!(settings.backup.database.port, 5432);
        assert!(!settings.backup.compress);
        assert_eq!(settings.backup.retention.daily, 3);
        assert!(!settings.schedule.weekly_enabled);
        assert_eq!(
            settings.backup.database.password.as_ref().map(Secret::expose),
            Some("hunter2")
        );
    }

    #[test]
    fn settings_come_from_the_environment() {
        std::env::set_var("BACKUP_APP_NAME", "inventory");
        let settings = Settings::from_env();
        std::env::remove_var("BACKUP_APP_NAME");

        let settings = settings.unwrap();
        assert_eq!(settings.backup.app_name, "inventory");
    }

    #[test]
    fn secrets_are_redacted() {
        let mut config = BackupConfig::with_backup_dir("/tmp/backups");
        config.database.password = Some(Secret::new("hunter2"));

        let json = serde_json::to_string(&config).unwrap();
        let debug = format!("{config:?}");

        assert!(!json.contains("hunter2"));
        assert!(json.contains(REDACTED));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn password_only_travels_via_env() {
        let mut database = DatabaseConfig::default();
        assert!(database.env().iter().all(|(key, _)| *key != "PGPASSWORD"));

        database.password = Some(Secret::new("pw"));
        assert!(database.env().contains(&("PGPASSWORD", "pw".to_string())));
    }

    #[test]
    fn definitions_cover_scheduled_tiers() {
        let mut schedule = ScheduleConfig::default();
        schedule.monthly_enabled = false;

        let definitions = schedule.definitions();
        let tiers: Vec<_> = definitions.iter().map(|d| d.tier).collect();

        assert_eq!(tiers, Tier::SCHEDULED);
        assert!(!definitions[2].enabled);
        assert_eq!(definitions[0].expression, "0 2 * * *");
    }

    #[test]
    fn timeout_zero_disables_bound() {
        let mut config = BackupConfig::with_backup_dir("/tmp");
        assert_eq!(config.dump_timeout(), Some(Duration::from_secs(3600)));

        config.dump_timeout_secs = 0;
        assert_eq!(config.dump_timeout(), None);
    }
}
