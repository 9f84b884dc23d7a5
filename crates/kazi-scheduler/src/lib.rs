//! # Kazi Scheduler
//!
//! Recurring-schedule trigger engine over the shared durable store.
//!
//! ## Features
//!
//! - One-shot, interval and cron schedule kinds as a tagged variant
//! - Pure, total next-run computation per kind, timezone aware
//! - Due-schedule polling for an external executor
//! - Immutable run history; firing and rescheduling are one transaction
//! - Activation toggling that preserves the computed next run

pub mod engine;
pub mod error;
pub mod next_run;
pub mod schedule;

pub use engine::ScheduleEngine;
pub use error::ScheduleError;
pub use next_run::next_run;
pub use schedule::{NewSchedule, RunOutcome, RunStatus, Schedule, ScheduleKind, ScheduleRun};
