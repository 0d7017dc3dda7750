use std::process::ExitCode;

use clap::Parser;
use pg_backup_lib::backup::BackupManager;
use pg_backup_lib::cli::{self, DatabaseAction, DatabaseCli};
use pg_backup_lib::config::Settings;

fn main() -> ExitCode {
    let DatabaseCli {
        verbose,
        settings,
        action,
    } = DatabaseCli::parse();
    cli::init_logger(verbose);
    settings.warn_unsupported();

    if let DatabaseAction::Config { json } = action {
        return print_config(&settings, json);
    }

    let manager = BackupManager::from_config(settings.backup.clone());

    match action {
        DatabaseAction::Create { tier } => match manager.create_backup(tier) {
            Ok(record) => {
                println!("{}\t{} bytes", record.path.display(), record.size);
                ExitCode::SUCCESS
            }
            Err(e) => {
                log::error!(target: "backup::manager", "Backup failed: {e}");
                ExitCode::FAILURE
            }
        },
        DatabaseAction::List => match manager.listing() {
            Ok(listing) => {
                for backup in &listing.backups {
                    println!(
                        "{}\t{}\t{}\t{} bytes",
                        backup.created.to_rfc3339(),
                        backup.tier,
                        backup.filename,
                        backup.size
                    );
                }
                println!(
                    "{} backup(s), {} bytes in total",
                    listing.backups.len(),
                    listing.total_size
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                log::error!(target: "backup::manager", "Listing backups failed: {e}");
                ExitCode::FAILURE
            }
        },
        DatabaseAction::Cleanup => match manager.clean_old_backups() {
            Ok(report) => {
                for filename in &report.deleted {
                    println!("deleted\t{filename}");
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                log::error!(target: "backup::manager", "Cleanup failed: {e}");
                ExitCode::FAILURE
            }
        },
        DatabaseAction::Restore { path } => match manager.restore_from_backup(&path) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                log::error!(target: "backup::manager", "Restore failed: {e}");
                ExitCode::FAILURE
            }
        },
        DatabaseAction::Verify { path } => {
            if manager.verify_backup(&path) {
                println!("valid\t{}", path.display());
                ExitCode::SUCCESS
            } else {
                println!("invalid\t{}", path.display());
                ExitCode::FAILURE
            }
        }
        DatabaseAction::Config { json } => print_config(&settings, json),
    }
}

fn print_config(settings: &Settings, json: bool) -> ExitCode {
    let rendered = if json {
        serde_json::to_string_pretty(settings).map_err(|e| e.to_string())
    } else {
        toml::to_string_pretty(settings).map_err(|e| e.to_string())
    };

    match rendered {
        Ok(rendered) => {
            println!("{rendered}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!(target: "config", "Rendering the configuration failed: {e}");
            ExitCode::FAILURE
        }
    }
}
