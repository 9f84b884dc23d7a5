//! Database handle shared by the queue and schedule engines.

use std::path::Path;
use std::time::Duration;

use tokio_rusqlite::Connection;
use tracing::debug;

use crate::error::StoreError;
use crate::schema::init_schema;

#[cfg(test)]
#[path = "db_tests.rs"]
mod tests;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the shared SQLite database.
///
/// Cloning is cheap; all clones funnel statements through the same
/// background connection thread. Independent worker processes may open
/// the same database file — WAL mode and the busy timeout make their
/// conditional updates queue up instead of failing fast.
#[derive(Clone)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a file-backed database.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(path.clone())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        conn.call(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            init_schema(conn)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        debug!("Database opened at {:?}", path);

        Ok(Self { conn })
    }

    /// Open a new in-memory database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        conn.call(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            init_schema(conn)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(Self { conn })
    }

    /// The underlying connection handle.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}
