//! Library to back up a [PostgreSQL][pg] database unattended.
//!
//! Dumps are created by the native `pg_dump` tool, stored in one backup
//! directory and removed again once they outlive the retention of their tier.
//! The lifecycle of a single backup lives in [`backup`], the cron driven
//! daily/weekly/monthly runs in [`scheduler`].
//!
//! [pg]: https://www.postgresql.org/

#![forbid(unsafe_code)]

pub mod backup;
pub mod cli;
pub mod config;
pub mod scheduler;
pub mod util;
