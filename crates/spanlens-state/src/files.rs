use crate::db::with_savepoint;
use rusqlite::{Connection, OptionalExtension, params};
use spanlens_core::error::StateError;

/// A source file known to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub language: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub mtime_ns: Option<i64>,
    pub indexed_at: String,
}

/// Insert or update a file row without disturbing its spans.
pub fn upsert_file(conn: &Connection, file: &FileRecord) -> Result<(), StateError> {
    conn.execute(
        "INSERT INTO files (path, language, content_hash, size_bytes, mtime_ns, indexed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(path) DO UPDATE SET
             language = excluded.language,
             content_hash = excluded.content_hash,
             size_bytes = excluded.size_bytes,
             mtime_ns = excluded.mtime_ns,
             indexed_at = excluded.indexed_at",
        params![
            file.path,
            file.language,
            file.content_hash,
            file.size_bytes as i64,
            file.mtime_ns,
            file.indexed_at,
        ],
    )
    .map_err(StateError::sqlite)?;
    Ok(())
}

pub fn get_file(conn: &Connection, path: &str) -> Result<Option<FileRecord>, StateError> {
    conn.query_row(
        "SELECT path, language, content_hash, size_bytes, mtime_ns, indexed_at
         FROM files WHERE path = ?1",
        params![path],
        |row| {
            Ok(FileRecord {
                path: row.get(0)?,
                language: row.get(1)?,
                content_hash: row.get(2)?,
                size_bytes: row.get::<_, i64>(3)?.max(0) as u64,
                mtime_ns: row.get(4)?,
                indexed_at: row.get(5)?,
            })
        },
    )
    .optional()
    .map_err(StateError::sqlite)
}

pub fn list_file_paths(conn: &Connection) -> Result<Vec<String>, StateError> {
    let mut stmt = conn
        .prepare("SELECT path FROM files ORDER BY path")
        .map_err(StateError::sqlite)?;
    let rows = stmt
        .query_map([], |row| row.get(0))
        .map_err(StateError::sqlite)?;
    rows.collect::<Result<Vec<String>, _>>()
        .map_err(StateError::sqlite)
}

/// Remove a file and everything derived from it.
///
/// Spans are deleted explicitly; their embeddings and enrichments follow via
/// `ON DELETE CASCADE`. Returns the number of spans removed.
pub fn delete_file(conn: &Connection, path: &str) -> Result<usize, StateError> {
    with_savepoint(conn, "delete_file", |conn| {
        let removed = conn
            .execute("DELETE FROM spans WHERE file_path = ?1", params![path])
            .map_err(StateError::sqlite)?;
        conn.execute("DELETE FROM files WHERE path = ?1", params![path])
            .map_err(StateError::sqlite)?;
        Ok(removed)
    })
}
