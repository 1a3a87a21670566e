use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    NotFound { path: String },

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid config value: {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("sqlite error: {0}")]
    Sqlite(String),

    #[error("vcs error: {0}")]
    Vcs(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("embedding provider error: {0}")]
    Embedding(String),

    #[error("span not found: {span_hash}")]
    SpanNotFound { span_hash: String },

    #[error("vector dimension mismatch: expected={expected}, actual={actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("ledger line rejected: {0}")]
    LedgerLine(String),

    #[error("invalid ignore rule: {0}")]
    IgnoreRule(String),

    #[error("resource busy: resource={resource}, holder={holder}")]
    ResourceBusy { resource: String, holder: String },

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StateError {
    /// Convenience constructor for SQLite errors, use with `.map_err(StateError::sqlite)`.
    pub fn sqlite<E: std::fmt::Display>(e: E) -> Self {
        Self::Sqlite(e.to_string())
    }

    /// Convenience constructor for VCS errors, use with `.map_err(StateError::vcs)`.
    pub fn vcs<E: std::fmt::Display>(e: E) -> Self {
        Self::Vcs(e.to_string())
    }

    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn embedding<E: std::fmt::Display>(e: E) -> Self {
        Self::Embedding(e.to_string())
    }

    pub fn span_not_found(span_hash: impl Into<String>) -> Self {
        Self::SpanNotFound {
            span_hash: span_hash.into(),
        }
    }

    pub fn resource_busy(resource: impl Into<String>, holder: impl Into<String>) -> Self {
        Self::ResourceBusy {
            resource: resource.into(),
            holder: holder.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum VcsError {
    #[error("not a git repository: {path}")]
    NotGitRepo { path: String },

    #[error("git error: {0}")]
    GitError(String),
}

/// Failures of the resource lock manager itself.
///
/// Contention outcomes (wait, wounded, not-owner) are not errors; they are
/// reported through the acquire and release outcome enums.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock io error: {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("lock record encoding failed: {0}")]
    Encoding(String),

    #[error("invalid lock request: {0}")]
    InvalidRequest(String),
}

impl LockError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn encoding<E: std::fmt::Display>(e: E) -> Self {
        Self::Encoding(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("enrichment backend error: {0}")]
    Backend(String),

    #[error("enrichment rejected: {0}")]
    Rejected(String),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

impl EnrichError {
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::Backend(e.to_string())
    }
}
