use serde::{Deserialize, Serialize};
use spanlens_core::constants;
use spanlens_core::error::StateError;
use spanlens_core::types::IndexState;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Per-repo record of the last indexing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStatus {
    pub repo: String,
    pub index_state: IndexState,
    pub last_indexed_at: Option<String>,
    pub last_indexed_commit: Option<String>,
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl IndexStatus {
    pub fn new(repo: impl Into<String>, index_state: IndexState) -> Self {
        Self {
            repo: repo.into(),
            index_state,
            last_indexed_at: None,
            last_indexed_commit: None,
            schema_version: constants::SCHEMA_VERSION,
            last_error: None,
        }
    }
}

/// Result of reading the status file. Readers must treat anything but
/// `Present` as "do not trust the index".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusRead {
    Present(IndexStatus),
    Missing,
    Malformed(String),
}

impl StatusRead {
    pub fn into_status(self) -> Option<IndexStatus> {
        match self {
            Self::Present(status) => Some(status),
            Self::Missing | Self::Malformed(_) => None,
        }
    }
}

pub fn read_status(path: &Path) -> StatusRead {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return StatusRead::Missing,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "index status unreadable");
            return StatusRead::Malformed(err.to_string());
        }
    };
    match serde_json::from_str::<IndexStatus>(&raw) {
        Ok(status) => StatusRead::Present(status),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "index status malformed");
            StatusRead::Malformed(err.to_string())
        }
    }
}

/// Overwrite the status file atomically (write to a sibling temp file, then rename).
pub fn write_status(path: &Path, status: &IndexStatus) -> Result<(), StateError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(StateError::Io)?;

    let body = serde_json::to_vec_pretty(status).map_err(StateError::serialization)?;
    let mut temp = NamedTempFile::new_in(parent).map_err(StateError::Io)?;
    temp.write_all(&body).map_err(StateError::Io)?;
    temp.write_all(b"\n").map_err(StateError::Io)?;
    temp.as_file().sync_all().map_err(StateError::Io)?;
    temp.persist(path).map_err(|e| StateError::Io(e.error))?;

    debug!(
        path = %path.display(),
        state = %status.index_state,
        "index status written"
    );
    Ok(())
}
