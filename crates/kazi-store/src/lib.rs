//! # Kazi Store
//!
//! The shared durable store behind the Kazi queue and schedule engines.
//!
//! One SQLite database holds the `jobs`, `schedules` and `schedule_runs`
//! tables. The engines in `kazi-queue` and `kazi-scheduler` are the only
//! writers of their respective tables; this crate owns the connection
//! handle and the schema, nothing else.

pub mod db;
pub mod error;
pub mod schema;

pub use db::Database;
pub use error::StoreError;
