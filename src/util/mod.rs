//! Helpers shared by the backup manager and the scheduler.

pub mod retention;
