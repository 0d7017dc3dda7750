//! Cron driven backups of the daily, weekly and monthly tiers.
//!
//! Every enabled tier gets its own job thread sleeping until the next fire
//! time of its cron expression. Jobs share nothing but the
//! [BackupManager], so a slow or failing tier never delays the others.

pub mod alert;
pub mod cron_expr;

pub use alert::{AlertError, AlertEvent, AlertSink, WebhookAlertSink};
pub use cron_expr::ScheduleConfigError;

use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use derive_more::{Display, Error, From};

use crate::backup::{BackupError, BackupManager, BackupRecord, InvalidTier, Tier};
use crate::config::ScheduleConfig;

/// Window in which at least one backup is expected.
const HEALTH_WINDOW: TimeDelta = TimeDelta::hours(24);

#[derive(Debug, Display, Error, From)]
pub enum SchedulerError {
    /// The requested backup type does not exist.
    #[from]
    InvalidBackupType(InvalidTier),
    /// The backup itself failed.
    #[from]
    Backup(BackupError),
    /// The configured time zone is unknown.
    #[display("Unknown time zone: {_0}")]
    Timezone(#[error(ignore)] String),
}

/// A running job bound to one tier.
struct JobHandle {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

impl JobHandle {
    fn spawn(name: String, body: impl FnOnce(mpsc::Receiver<()>) + Send + 'static) -> std::io::Result<Self> {
        let (stop, stopped) = mpsc::channel();
        let thread = thread::Builder::new().name(name).spawn(move || body(stopped))?;

        Ok(Self { stop, thread })
    }

    fn stop(self) {
        let _ = self.stop.send(());
        // a job dropping the last scheduler handle must not join itself
        if self.thread.thread().id() == thread::current().id() {
            return;
        }
        if self.thread.join().is_err() {
            log::error!(target: "scheduler", "A scheduler job panicked");
        }
    }
}

#[derive(Default)]
struct Jobs {
    tiers: BTreeMap<Tier, JobHandle>,
    health_check: Option<JobHandle>,
}

impl Jobs {
    /// Started and not stopped since, even if no tier got a job.
    fn is_active(&self) -> bool {
        !self.tiers.is_empty() || self.health_check.is_some()
    }
}

/// Snapshot of the scheduler state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    /// Tiers with an active job.
    pub jobs: Vec<Tier>,
    pub schedules: BTreeMap<Tier, String>,
    pub enabled: BTreeMap<Tier, bool>,
    /// Next fire time of every enabled tier with a valid expression.
    pub next_runs: BTreeMap<Tier, DateTime<Utc>>,
    pub timezone: String,
}

/// Whether backups happened recently.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    /// At least one backup in the last 24 hours.
    pub healthy: bool,
    pub recent_backups: usize,
    pub total_backups: usize,
    pub latest: Option<BackupRecord>,
    pub checked_at: DateTime<Utc>,
}

/// Runs the scheduled tiers of one [BackupManager].
///
/// Construct once and share it by handle; dropping it stops all jobs.
pub struct Scheduler {
    manager: Arc<BackupManager>,
    config: ScheduleConfig,
    timezone: Tz,
    alerts: Option<Arc<dyn AlertSink>>,
    jobs: Mutex<Jobs>,
}

impl Scheduler {
    pub fn new(manager: Arc<BackupManager>, config: ScheduleConfig) -> Result<Self, SchedulerError> {
        let timezone = config
            .timezone
            .parse::<Tz>()
            .map_err(|_| SchedulerError::Timezone(config.timezone.clone()))?;

        Ok(Self {
            manager,
            config,
            timezone,
            alerts: None,
            jobs: Mutex::new(Jobs::default()),
        })
    }

    /// Report failed scheduled backups to `sink`.
    pub fn with_alerts(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(sink);
        self
    }

    pub fn manager(&self) -> &Arc<BackupManager> {
        &self.manager
    }

    fn jobs(&self) -> MutexGuard<'_, Jobs> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Checks the cron expression of every scheduled tier.
    ///
    /// Invalid expressions are logged and reported as `false`.
    pub fn validate_schedules(&self) -> BTreeMap<Tier, bool> {
        self.config
            .definitions()
            .into_iter()
            .map(|definition| {
                let valid = match cron_expr::parse(definition.tier, &definition.expression) {
                    Ok(_) => true,
                    Err(e) => {
                        log::error!(target: "scheduler", "{e}");
                        false
                    }
                };
                (definition.tier, valid)
            })
            .collect()
    }

    /// Starts a job for every enabled tier with a valid expression.
    ///
    /// Tiers failing to schedule are skipped, the others still start.
    /// Calling it while running restarts nothing.
    pub fn start(self: &Arc<Self>) {
        let mut jobs = self.jobs();
        if jobs.is_active() {
            log::warn!(target: "scheduler", "Scheduler already running");
            return;
        }
        log::info!(target: "scheduler", "Starting backup scheduler (time zone {})", self.config.timezone);

        for definition in self.config.definitions() {
            let tier = definition.tier;
            if !definition.enabled {
                log::info!(target: "scheduler", "{tier} backups disabled");
                continue;
            }
            let schedule = match cron_expr::parse(tier, &definition.expression) {
                Ok(schedule) => schedule,
                Err(e) => {
                    log::error!(target: "scheduler", "{e}, {tier} backups are not scheduled");
                    continue;
                }
            };

            let scheduler = Arc::downgrade(self);
            let timezone = self.timezone;
            let job = JobHandle::spawn(format!("backup-{tier}"), move |stopped| {
                run_job(tier, schedule, timezone, stopped, move || {
                    if let Some(scheduler) = scheduler.upgrade() {
                        scheduler.create_scheduled_backup(tier);
                    }
                })
            });
            match job {
                Ok(job) => {
                    log::info!(target: "scheduler", "Scheduled {tier} backups: {}", definition.expression);
                    jobs.tiers.insert(tier, job);
                }
                Err(e) => log::error!(target: "scheduler", "Unable to start {tier} job: {e}"),
            }
        }

        let scheduler = Arc::downgrade(self);
        let delay = Duration::from_secs(self.config.health_check_delay_secs);
        let health_check = JobHandle::spawn("backup-health".into(), move |stopped| {
            if let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(delay) {
                if let Some(scheduler) = scheduler.upgrade() {
                    scheduler.log_health();
                }
            }
        });
        match health_check {
            Ok(job) => jobs.health_check = Some(job),
            Err(e) => log::warn!(target: "scheduler", "Unable to schedule initial health check: {e}"),
        }

        log::info!(target: "scheduler", "Backup scheduler started with {} job(s)", jobs.tiers.len());
    }

    /// Stops and discards all jobs. Does nothing if not running.
    ///
    /// Backups in progress finish first.
    pub fn stop(&self) {
        let stopped = std::mem::take(&mut *self.jobs());
        if !stopped.is_active() {
            return;
        }
        let Jobs {
            tiers,
            health_check,
        } = stopped;

        log::info!(target: "scheduler", "Stopping backup scheduler");
        for (tier, job) in tiers {
            job.stop();
            log::debug!(target: "scheduler", "Stopped {tier} job");
        }
        if let Some(job) = health_check {
            job.stop();
        }
        log::info!(target: "scheduler", "Backup scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.jobs().is_active()
    }

    /// Runs the backup of a scheduled tier, followed by retention cleanup.
    ///
    /// Failures are logged and alerted, never returned, so the job keeps firing.
    pub fn create_scheduled_backup(&self, tier: Tier) {
        log::info!(target: "scheduler", "Starting scheduled {tier} backup");
        let started = Instant::now();

        match self.backup_and_clean(tier) {
            Ok(record) => {
                log::info!(
                    target: "scheduler",
                    "Scheduled {tier} backup finished in {:.1}s: {} ({} bytes)",
                    started.elapsed().as_secs_f64(),
                    record.filename,
                    record.size
                );
            }
            Err(e) => {
                log::error!(
                    target: "scheduler",
                    "Scheduled {tier} backup failed after {:.1}s: {e}",
                    started.elapsed().as_secs_f64()
                );
                if let Some(sink) = &self.alerts {
                    alert::dispatch(Arc::clone(sink), AlertEvent::backup_failed(tier, &e));
                }
            }
        }
    }

    fn backup_and_clean(&self, tier: Tier) -> Result<BackupRecord, BackupError> {
        let record = self.manager.create_backup(tier)?;

        if let Err(e) = self.manager.clean_old_backups() {
            log::error!(target: "scheduler", "Cleanup after {tier} backup failed: {e}");
        }
        Ok(record)
    }

    /// Runs a backup of the named tier right away.
    ///
    /// Unknown tiers are rejected before anything touches the disk.
    pub fn trigger_backup(&self, tier: &str) -> Result<BackupRecord, SchedulerError> {
        let tier: Tier = tier.parse()?;
        log::info!(target: "scheduler", "Manually triggered {tier} backup");

        Ok(self.backup_and_clean(tier)?)
    }

    pub fn get_status(&self) -> SchedulerStatus {
        let (running, jobs) = {
            let active = self.jobs();
            (active.is_active(), active.tiers.keys().copied().collect::<Vec<Tier>>())
        };
        let definitions = self.config.definitions();

        let next_runs = definitions
            .iter()
            .filter(|definition| definition.enabled)
            .filter_map(|definition| {
                let schedule = cron_expr::parse(definition.tier, &definition.expression).ok()?;
                let next = next_run(&schedule, self.timezone)?;
                Some((definition.tier, next))
            })
            .collect();

        SchedulerStatus {
            running,
            jobs,
            schedules: definitions
                .iter()
                .map(|definition| (definition.tier, definition.expression.clone()))
                .collect(),
            enabled: definitions
                .iter()
                .map(|definition| (definition.tier, definition.enabled))
                .collect(),
            next_runs,
            timezone: self.config.timezone.clone(),
        }
    }

    /// Reports whether a backup happened in the last 24 hours.
    ///
    /// Informational; an unreadable backup directory counts as unhealthy.
    pub fn health_check(&self) -> HealthReport {
        let now = Utc::now();
        let backups = self.manager.list_backups().unwrap_or_else(|e| {
            log::error!(target: "scheduler", "Health check can't list backups: {e}");
            Vec::new()
        });

        let recent_backups = backups
            .iter()
            .filter(|backup| now - backup.created <= HEALTH_WINDOW)
            .count();

        HealthReport {
            healthy: recent_backups > 0,
            recent_backups,
            total_backups: backups.len(),
            latest: backups.into_iter().next(),
            checked_at: now,
        }
    }

    fn log_health(&self) {
        let report = self.health_check();
        if report.healthy {
            log::info!(target: "scheduler", "Health check: {} backup(s) in the last 24h", report.recent_backups);
        } else {
            log::warn!(target: "scheduler", "Health check: no backup in the last 24h ({} total)", report.total_backups);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn next_run(schedule: &Schedule, timezone: Tz) -> Option<DateTime<Utc>> {
    schedule
        .upcoming(timezone)
        .next()
        .map(|next| next.with_timezone(&Utc))
}

/// Body of a tier job: sleep until the next fire time, run, repeat until stopped.
fn run_job(
    tier: Tier,
    schedule: Schedule,
    timezone: Tz,
    stopped: mpsc::Receiver<()>,
    mut fire: impl FnMut(),
) {
    loop {
        let Some(next) = next_run(&schedule, timezone) else {
            log::warn!(target: "scheduler", "No upcoming {tier} run, job ends");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        log::debug!(target: "scheduler", "Next {tier} backup at {next}");

        match stopped.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => fire(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
