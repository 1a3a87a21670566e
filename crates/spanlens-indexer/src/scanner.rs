use crate::ingest::{ExtractedFile, SpanDraft};
use ignore::WalkBuilder;
use spanlens_core::constants;
use spanlens_core::languages;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A discovered source file with its detected language.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub relative_path: String,
    pub language: String,
}

const BUILTIN_IGNORE_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    "target",
    "build",
    "dist",
    "vendor",
    ".venv",
];

/// Walk the repo for files with a known language, honouring `.gitignore`
/// and `.spanlensignore`. Files larger than `max_file_size` are skipped.
pub fn scan_directory(repo_root: &Path, max_file_size: u64) -> Vec<ScannedFile> {
    let mut walker = WalkBuilder::new(repo_root);
    walker
        .hidden(true)
        .git_ignore(true)
        .git_global(false)
        .git_exclude(false)
        .require_git(false)
        .add_custom_ignore_filename(constants::IGNORE_FILE);

    let mut files = Vec::new();
    for entry in walker.build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Walk error: {}", e);
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_some_and(|kind| kind.is_file()) {
            continue;
        }

        let relative = path
            .strip_prefix(repo_root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        if relative
            .split('/')
            .any(|component| BUILTIN_IGNORE_DIRS.contains(&component))
        {
            debug!(?path, "Skipped by built-in ignore");
            continue;
        }

        if let Ok(metadata) = std::fs::metadata(path)
            && metadata.len() > max_file_size
        {
            warn!(?path, size = metadata.len(), "Skipped: file too large");
            continue;
        }

        if let Some(language) = languages::detect_language_for_path(&relative) {
            files.push(ScannedFile {
                path: path.to_path_buf(),
                relative_path: relative,
                language: language.to_string(),
            });
        }
    }
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    files
}

/// Fallback chunking when no symbol extractor is available: the whole file
/// becomes one `module` span.
pub fn whole_file_extraction(scanned: &ScannedFile) -> Option<ExtractedFile> {
    let text = match std::fs::read_to_string(&scanned.path) {
        Ok(text) => text,
        Err(err) => {
            warn!(path = %scanned.relative_path, error = %err, "Skipped unreadable file");
            return None;
        }
    };
    let line_count = text.lines().count() as u32;
    if line_count == 0 {
        return None;
    }
    let symbol = Path::new(&scanned.relative_path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| scanned.relative_path.clone());
    Some(ExtractedFile {
        path: scanned.relative_path.clone(),
        language: scanned.language.clone(),
        spans: vec![SpanDraft {
            symbol,
            kind: "module".to_string(),
            start_line: 1,
            end_line: line_count,
        }],
    })
}
