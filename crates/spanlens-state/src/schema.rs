use rusqlite::Connection;
use spanlens_core::error::StateError;
use tracing::info;

/// Current schema version. Bump this when adding a new migration step.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Create all required SQLite tables and run any pending migrations.
pub fn create_tables(conn: &Connection) -> Result<(), StateError> {
    conn.execute_batch(SCHEMA_SQL).map_err(StateError::sqlite)?;
    migrate(conn)?;
    info!("SQLite schema created (version {})", CURRENT_SCHEMA_VERSION);
    Ok(())
}

/// Run incremental schema migrations up to `CURRENT_SCHEMA_VERSION`.
///
/// The `schema_migrations` table tracks which version has been applied.
pub fn migrate(conn: &Connection) -> Result<(), StateError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(StateError::sqlite)?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(StateError::sqlite)?;

    type MigrationFn = fn(&Connection) -> Result<(), StateError>;

    let migrations: &[MigrationFn] = &[
        // V1: baseline tables come from SCHEMA_SQL.
        |_conn| Ok(()),
        // V2: backfill the lexical index for databases created before spans_fts existed.
        |conn| {
            conn.execute_batch(
                "DELETE FROM spans_fts;
                 INSERT INTO spans_fts (span_hash, file_path, symbol, text)
                     SELECT span_hash, file_path, symbol, text FROM spans;",
            )
            .map_err(StateError::sqlite)?;
            Ok(())
        },
    ];

    for version in (current + 1)..=(CURRENT_SCHEMA_VERSION) {
        let idx = (version - 1) as usize;
        if idx < migrations.len() {
            migrations[idx](conn)?;
        }
        conn.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(StateError::sqlite)?;
        info!(version, "Applied schema migration");
    }

    Ok(())
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    language TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    mtime_ns INTEGER,
    indexed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS spans (
    span_hash TEXT PRIMARY KEY,
    file_path TEXT NOT NULL REFERENCES files(path) ON DELETE CASCADE,
    language TEXT NOT NULL,
    symbol TEXT NOT NULL,
    kind TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    text TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_spans_file_start
    ON spans(file_path, start_line);

CREATE TABLE IF NOT EXISTS embeddings (
    span_hash TEXT NOT NULL REFERENCES spans(span_hash) ON DELETE CASCADE,
    model TEXT NOT NULL,
    dim INTEGER NOT NULL,
    vector BLOB NOT NULL,
    normalized INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    PRIMARY KEY(span_hash, model)
);

CREATE INDEX IF NOT EXISTS idx_embeddings_model
    ON embeddings(model);

CREATE TABLE IF NOT EXISTS enrichments (
    span_hash TEXT PRIMARY KEY REFERENCES spans(span_hash) ON DELETE CASCADE,
    summary TEXT NOT NULL,
    inputs TEXT NOT NULL,
    outputs TEXT NOT NULL,
    side_effects TEXT NOT NULL,
    pitfalls TEXT NOT NULL,
    usage_snippet TEXT,
    evidence TEXT NOT NULL,
    model TEXT NOT NULL,
    schema_version INTEGER NOT NULL,
    tags TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS spans_fts USING fts5(
    span_hash UNINDEXED,
    file_path,
    symbol,
    text,
    tokenize = 'unicode61'
);

CREATE TRIGGER IF NOT EXISTS spans_fts_insert AFTER INSERT ON spans BEGIN
    INSERT INTO spans_fts (span_hash, file_path, symbol, text)
        VALUES (new.span_hash, new.file_path, new.symbol, new.text);
END;

CREATE TRIGGER IF NOT EXISTS spans_fts_delete AFTER DELETE ON spans BEGIN
    DELETE FROM spans_fts WHERE span_hash = old.span_hash;
END;

CREATE TRIGGER IF NOT EXISTS spans_fts_update AFTER UPDATE ON spans BEGIN
    DELETE FROM spans_fts WHERE span_hash = old.span_hash;
    INSERT INTO spans_fts (span_hash, file_path, symbol, text)
        VALUES (new.span_hash, new.file_path, new.symbol, new.text);
END;
"#;
