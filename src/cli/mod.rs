//! Command line interfaces of `backup-database` and `backup-scheduler`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::LevelFilter;

use crate::backup::Tier;
use crate::config::Settings;

/// Name of the file recording the pid of a running scheduler.
pub const PID_FILENAME: &str = ".scheduler.pid";

/// Create, inspect and restore database backups.
#[derive(Parser, Debug)]
#[command(name = "backup-database", version, about, long_about = None)]
pub struct DatabaseCli {
    /// Verbosity of the command output.
    #[arg(long, global = true)]
    pub verbose: Option<LevelFilter>,

    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub action: DatabaseAction,
}

#[derive(Subcommand, Debug)]
pub enum DatabaseAction {
    /// Dump the database into a new backup.
    Create {
        /// Tier of the new backup.
        #[arg(value_enum, default_value = "manual")]
        tier: Tier,
    },
    /// List backups, newest first.
    List,
    /// Delete backups past their retention.
    Cleanup,
    /// Restore the database from a backup.
    Restore { path: PathBuf },
    /// Check a backup is non-empty and its compression intact.
    Verify { path: PathBuf },
    /// Print the configuration with secrets redacted.
    Config {
        /// Print JSON instead of TOML.
        #[arg(long)]
        json: bool,
    },
}

/// Run database backups on a cron schedule.
#[derive(Parser, Debug)]
#[command(name = "backup-scheduler", version, about, long_about = None)]
pub struct SchedulerCli {
    /// Verbosity of the command output.
    #[arg(long, global = true)]
    pub verbose: Option<LevelFilter>,

    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub action: SchedulerAction,
}

#[derive(Subcommand, Debug)]
pub enum SchedulerAction {
    /// Run the scheduler until SIGINT or SIGTERM.
    Start,
    /// Stop a scheduler started by `start`.
    Stop,
    /// Show schedules, next runs and whether a scheduler is running.
    Status,
    /// Report whether a backup happened in the last 24 hours.
    Health,
    /// Run a scheduled backup now.
    Trigger {
        /// daily, weekly, monthly or manual.
        tier: String,
    },
}

/// Initializes `env_logger`, `verbose` overriding `RUST_LOG`.
pub fn init_logger(verbose: Option<LevelFilter>) {
    let mut env_logger = env_logger::builder();
    if let Some(level) = verbose {
        env_logger.filter_level(level);
    }
    if let Err(e) = env_logger.try_init() {
        eprintln!("Initializing the logger failed: {e}");
    }
}

/// Pid file of the scheduler working on `backup_dir`.
pub fn pid_file(backup_dir: &Path) -> PathBuf {
    backup_dir.join(PID_FILENAME)
}

pub fn write_pid(backup_dir: &Path) -> io::Result<()> {
    fs::create_dir_all(backup_dir)?;
    fs::write(pid_file(backup_dir), std::process::id().to_string())
}

/// Pid recorded in the pid file, if any.
pub fn read_pid(backup_dir: &Path) -> io::Result<Option<u32>> {
    match fs::read_to_string(pid_file(backup_dir)) {
        Ok(content) => content
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Removes the pid file if it still names this process.
pub fn remove_pid(backup_dir: &Path) {
    if let Ok(Some(pid)) = read_pid(backup_dir) {
        if pid == std::process::id() {
            let _ = fs::remove_file(pid_file(backup_dir));
        }
    }
}

#[cfg(unix)]
fn unix_pid(pid: u32) -> io::Result<nix::unistd::Pid> {
    i32::try_from(pid)
        .map(nix::unistd::Pid::from_raw)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Sends SIGTERM to `pid`; returns if there was a process to receive it.
#[cfg(unix)]
pub fn terminate(pid: u32) -> io::Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};

    match kill(unix_pid(pid)?, Signal::SIGTERM) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) -> io::Result<bool> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "stopping a scheduler requires a unix platform",
    ))
}

/// Whether a process with `pid` is alive.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Ok(pid) = unix_pid(pid) else {
        return false;
    };
    // EPERM: alive, owned by someone else
    matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}
