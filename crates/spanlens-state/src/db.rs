use rusqlite::Connection;
use spanlens_core::error::StateError;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

static SAVEPOINT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Open a SQLite connection with default pragmas.
pub fn open_connection(db_path: &Path) -> Result<Connection, StateError> {
    open_connection_with_config(db_path, 5000, -64000)
}

/// Open a SQLite connection with configurable pragmas.
pub fn open_connection_with_config(
    db_path: &Path,
    busy_timeout_ms: u32,
    cache_size: i32,
) -> Result<Connection, StateError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(StateError::Io)?;
    }

    let conn = Connection::open(db_path).map_err(StateError::sqlite)?;

    apply_pragmas(&conn, busy_timeout_ms, cache_size)?;

    info!(?db_path, "SQLite connection opened");
    Ok(conn)
}

fn apply_pragmas(
    conn: &Connection,
    busy_timeout_ms: u32,
    cache_size: i32,
) -> Result<(), StateError> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = {};
         PRAGMA cache_size = {};",
        busy_timeout_ms, cache_size
    ))
    .map_err(StateError::sqlite)?;
    Ok(())
}

/// Run SQLite quick_check to verify database integrity.
/// Returns Ok(true) if healthy, Ok(false) with error detail otherwise.
pub fn check_sqlite_health(conn: &Connection) -> Result<(bool, Option<String>), StateError> {
    let result: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(StateError::sqlite)?;

    if result == "ok" {
        Ok((true, None))
    } else {
        Ok((false, Some(result)))
    }
}

/// Run `body` inside a uniquely named savepoint.
///
/// The savepoint is released when `body` succeeds and rolled back when it
/// fails, so callers never leave partially applied rows behind. Savepoints
/// nest, which lets a store function be called inside a wider batch.
pub fn with_savepoint<T, F>(conn: &Connection, label: &str, body: F) -> Result<T, StateError>
where
    F: FnOnce(&Connection) -> Result<T, StateError>,
{
    let savepoint = format!(
        "spanlens_{label}_{}",
        SAVEPOINT_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    conn.execute_batch(&format!("SAVEPOINT {savepoint}"))
        .map_err(StateError::sqlite)?;

    match body(conn) {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {savepoint}"))
                .map_err(StateError::sqlite)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) =
                conn.execute_batch(&format!("ROLLBACK TO {savepoint}; RELEASE {savepoint}"))
            {
                warn!(
                    %savepoint,
                    error = %rollback_err,
                    in_transaction = !conn.is_autocommit(),
                    "savepoint rollback failed"
                );
            }
            Err(err)
        }
    }
}
