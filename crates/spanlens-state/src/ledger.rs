//! Append-only JSONL ledger of enrichment attempts.
//!
//! Every append holds an exclusive advisory lock on the ledger file for the
//! duration of write+flush, so independent processes can share one ledger
//! without interleaving partial lines. A process killed mid-write can still
//! leave a torn line behind; `repair_ledger` removes those.

use fs4::FileExt;
use serde::{Deserialize, Serialize};
use spanlens_core::error::StateError;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// One immutable ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentEvent {
    pub timestamp: String,
    pub span_hash: String,
    pub success: bool,
    pub duration_ms: u64,
    pub model: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EnrichmentEvent {
    pub fn success(span_hash: impl Into<String>, model: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            timestamp: spanlens_core::time::now_iso8601(),
            span_hash: span_hash.into(),
            success: true,
            duration_ms,
            model: model.into(),
            prompt_tokens: None,
            completion_tokens: None,
            error: None,
        }
    }

    pub fn failure(
        span_hash: impl Into<String>,
        model: impl Into<String>,
        duration_ms: u64,
        error: &str,
        max_error_chars: usize,
    ) -> Self {
        Self {
            success: false,
            error: Some(truncate_error(error, max_error_chars)),
            ..Self::success(span_hash, model, duration_ms)
        }
    }

    pub fn with_tokens(mut self, prompt: Option<u64>, completion: Option<u64>) -> Self {
        self.prompt_tokens = prompt;
        self.completion_tokens = completion;
        self
    }
}

/// Truncate on a char boundary, marking the cut with an ellipsis.
pub fn truncate_error(error: &str, max_chars: usize) -> String {
    if error.chars().count() <= max_chars {
        return error.to_string();
    }
    let mut out: String = error.chars().take(max_chars).collect();
    out.push('…');
    out
}

/// Counts reported by `repair_ledger`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub valid: usize,
    pub discarded: usize,
    pub backup: Option<PathBuf>,
}

fn open_locked(path: &Path, append: bool) -> Result<File, StateError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(StateError::Io)?;
    }
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.read(true).write(true).truncate(false);
    }
    let file = options.open(path).map_err(StateError::Io)?;
    file.lock_exclusive().map_err(StateError::Io)?;
    Ok(file)
}

/// Append one event as a single JSON line.
///
/// The serialized line is parsed back before anything touches the file, so
/// the ledger never receives a line that fails to parse.
pub fn append_event(path: &Path, event: &EnrichmentEvent) -> Result<(), StateError> {
    let line = serde_json::to_string(event).map_err(StateError::serialization)?;
    if line.contains('\n') {
        return Err(StateError::LedgerLine("serialized event spans lines".to_string()));
    }
    serde_json::from_str::<serde_json::Value>(&line)
        .map_err(|e| StateError::LedgerLine(e.to_string()))?;

    let mut file = open_locked(path, true)?;
    let result = (|| {
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_data()
    })();
    let _ = FileExt::unlock(&file);
    result.map_err(StateError::Io)?;

    debug!(span_hash = %event.span_hash, success = event.success, "ledger event appended");
    Ok(())
}

fn is_valid_line(line: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(line) else {
        return false;
    };
    !text.trim().is_empty() && serde_json::from_str::<serde_json::Value>(text).is_ok()
}

fn split_lines(bytes: &[u8]) -> Vec<&[u8]> {
    let mut lines: Vec<&[u8]> = bytes.split(|b| *b == b'\n').collect();
    if lines.last().is_some_and(|last| last.is_empty()) {
        lines.pop();
    }
    lines
}

/// Keep parseable JSON lines and drop the rest.
///
/// When something is dropped the original file is first renamed to
/// `<name>.bak`; a clean ledger is left untouched and no backup is made.
/// Repair assumes no concurrent appends to the same ledger.
pub fn repair_ledger(path: &Path) -> Result<RepairReport, StateError> {
    if !path.exists() {
        return Ok(RepairReport {
            valid: 0,
            discarded: 0,
            backup: None,
        });
    }

    let mut file = open_locked(path, false)?;
    let mut bytes = Vec::new();
    let read = file.read_to_end(&mut bytes);
    if let Err(err) = read {
        let _ = FileExt::unlock(&file);
        return Err(StateError::Io(err));
    }

    let mut kept: Vec<&[u8]> = Vec::new();
    let mut discarded = 0;
    for line in split_lines(&bytes) {
        if is_valid_line(line) {
            kept.push(line);
        } else {
            discarded += 1;
        }
    }

    if discarded == 0 {
        let _ = FileExt::unlock(&file);
        return Ok(RepairReport {
            valid: kept.len(),
            discarded: 0,
            backup: None,
        });
    }

    let result = rewrite_with_backup(path, &kept);
    let _ = FileExt::unlock(&file);
    let backup = result?;

    info!(
        path = %path.display(),
        valid = kept.len(),
        discarded,
        backup = %backup.display(),
        "ledger repaired"
    );
    Ok(RepairReport {
        valid: kept.len(),
        discarded,
        backup: Some(backup),
    })
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}

fn rewrite_with_backup(path: &Path, kept: &[&[u8]]) -> Result<PathBuf, StateError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(parent).map_err(StateError::Io)?;
    for line in kept {
        temp.write_all(line).map_err(StateError::Io)?;
        temp.write_all(b"\n").map_err(StateError::Io)?;
    }
    temp.as_file().sync_all().map_err(StateError::Io)?;

    let backup = backup_path(path);
    std::fs::rename(path, &backup).map_err(StateError::Io)?;
    if let Err(err) = temp.persist(path) {
        warn!(path = %path.display(), error = %err.error, "ledger rewrite failed; restoring original");
        let _ = std::fs::rename(&backup, path);
        return Err(StateError::Io(err.error));
    }
    Ok(backup)
}

/// Parse every valid event in the ledger, skipping lines that do not decode.
pub fn read_events(path: &Path) -> Result<Vec<EnrichmentEvent>, StateError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StateError::Io(err)),
    };
    Ok(split_lines(&bytes)
        .into_iter()
        .filter_map(|line| serde_json::from_slice::<EnrichmentEvent>(line).ok())
        .collect())
}
