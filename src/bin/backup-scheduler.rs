use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use pg_backup_lib::backup::BackupManager;
use pg_backup_lib::cli::{self, SchedulerAction, SchedulerCli};
use pg_backup_lib::scheduler::{Scheduler, WebhookAlertSink};

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::warn!(target: "scheduler", "Unable to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn main() -> ExitCode {
    let SchedulerCli {
        verbose,
        settings,
        action,
    } = SchedulerCli::parse();
    cli::init_logger(verbose);
    settings.warn_unsupported();

    let backup_dir = settings.backup.backup_dir.clone();

    if let SchedulerAction::Stop = action {
        return match cli::read_pid(&backup_dir) {
            Ok(Some(pid)) => match cli::terminate(pid) {
                Ok(true) => {
                    log::info!(target: "scheduler", "Sent SIGTERM to scheduler (pid {pid})");
                    ExitCode::SUCCESS
                }
                Ok(false) => {
                    log::warn!(target: "scheduler", "Scheduler (pid {pid}) is not running");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    log::error!(target: "scheduler", "Stopping scheduler (pid {pid}) failed: {e}");
                    ExitCode::FAILURE
                }
            },
            Ok(None) => {
                log::info!(target: "scheduler", "No scheduler running");
                ExitCode::SUCCESS
            }
            Err(e) => {
                log::error!(target: "scheduler", "Reading scheduler pid file failed: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let manager = Arc::new(BackupManager::from_config(settings.backup));
    let mut scheduler = match Scheduler::new(manager, settings.schedule) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            log::error!(target: "scheduler", "{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(url) = settings.alert.webhook_url {
        match WebhookAlertSink::new(url) {
            Ok(sink) => scheduler = scheduler.with_alerts(Arc::new(sink)),
            Err(e) => log::warn!(target: "scheduler::alert", "Alerts disabled, webhook client unavailable: {e}"),
        }
    }
    let scheduler = Arc::new(scheduler);

    match action {
        SchedulerAction::Start => run(&scheduler, &backup_dir),
        SchedulerAction::Stop => ExitCode::SUCCESS,
        SchedulerAction::Status => {
            let status = scheduler.get_status();
            let valid = scheduler.validate_schedules();
            let recorded = cli::read_pid(&backup_dir).ok().flatten();
            let running = recorded.is_some_and(cli::process_alive);
            let jobs: Vec<_> = valid
                .iter()
                .filter(|(tier, valid)| running && **valid && status.enabled[*tier])
                .map(|(tier, _)| *tier)
                .collect();

            let report = serde_json::json!({
                "running": running,
                "pid": recorded.filter(|_| running),
                "jobs": jobs,
                "schedules": status.schedules,
                "enabled": status.enabled,
                "valid": valid,
                "nextRuns": status.next_runs,
                "timezone": status.timezone,
            });
            print_json(&report)
        }
        SchedulerAction::Health => {
            let report = scheduler.health_check();
            let code = print_json(&report);
            if report.healthy {
                code
            } else {
                ExitCode::FAILURE
            }
        }
        SchedulerAction::Trigger { tier } => match scheduler.trigger_backup(&tier) {
            Ok(record) => {
                println!("{}\t{} bytes", record.path.display(), record.size);
                ExitCode::SUCCESS
            }
            Err(e) => {
                log::error!(target: "scheduler", "Triggered backup failed: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

fn run(scheduler: &Arc<Scheduler>, backup_dir: &std::path::Path) -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!(target: "scheduler", "Unable to set up signal handling: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = cli::write_pid(backup_dir) {
        log::warn!(target: "scheduler", "Writing pid file failed: {e}");
    }
    scheduler.start();

    runtime.block_on(shutdown_signal());
    log::info!(target: "scheduler", "Shutdown signal received");

    scheduler.stop();
    cli::remove_pid(backup_dir);
    ExitCode::SUCCESS
}

fn print_json(value: &impl serde::Serialize) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Rendering output failed: {e}");
            ExitCode::FAILURE
        }
    }
}
