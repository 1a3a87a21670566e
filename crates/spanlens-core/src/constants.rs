/// Default data directory name, relative to the repo root (or home for the global config).
pub const DEFAULT_DATA_DIR: &str = ".spanlens";

/// Project config file name.
pub const PROJECT_CONFIG_FILE: &str = ".spanlens/config.toml";

/// Ignore file name, read in addition to `.gitignore`.
pub const IGNORE_FILE: &str = ".spanlensignore";

/// SQLite database file name inside the data directory.
pub const INDEX_DB_FILE: &str = "index.db";

/// IndexStatus file name inside the data directory.
pub const INDEX_STATUS_FILE: &str = "index_status.json";

/// Current schema version for SQLite tables and the status file.
pub const SCHEMA_VERSION: u32 = 1;

/// Current enrichment payload schema version.
pub const ENRICHMENT_SCHEMA_VERSION: u32 = 1;

/// Maximum file size to index (1MB).
pub const MAX_FILE_SIZE: u64 = 1_048_576;

/// Maximum words in an enrichment summary.
pub const MAX_SUMMARY_WORDS: usize = 120;

/// Maximum lines in an enrichment usage snippet.
pub const MAX_USAGE_SNIPPET_LINES: usize = 12;

/// Number of leading characters of span text considered by the reranker.
pub const RERANK_TEXT_CHARS: usize = 1500;

/// Resource key prefix for indexing runs.
pub const INDEX_RESOURCE_PREFIX: &str = "index:";

/// Resource key prefix for enrichment runs.
pub const ENRICH_RESOURCE_PREFIX: &str = "enrich:";
