use rusqlite::Connection;
use spanlens_core::config::Config;
use spanlens_core::constants;
use spanlens_core::error::StateError;
use spanlens_core::span_hash::{HashAlgorithm, span_hash};
use spanlens_core::types::{IndexState, Span, SpanRecord};
use spanlens_state::files::{self, FileRecord};
use spanlens_state::ignore_rules::IgnoreRules;
use spanlens_state::index_status::{self, IndexStatus, StatusRead};
use spanlens_state::locks::{HeldLock, LockService, TaskIdentity};
use spanlens_state::spans;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// A symbol-level slice proposed by an extractor, before hashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanDraft {
    pub symbol: String,
    pub kind: String,
    pub start_line: u32,
    pub end_line: u32,
}

/// One source file and the spans extracted from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFile {
    pub path: String,
    pub language: String,
    pub spans: Vec<SpanDraft>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexReport {
    pub files_indexed: usize,
    pub files_skipped: usize,
    pub files_removed: usize,
    pub spans_written: usize,
    pub spans_removed: usize,
    pub interrupted: bool,
    /// A previous run left the status at `rebuilding`.
    pub recovered_interrupted_run: bool,
    pub final_state: IndexState,
    pub duration_ms: u64,
}

enum FileOutcome {
    Indexed(spans::ReplaceStats),
    Skipped,
    Removed(usize),
}

/// Name of the resource lock guarding index writes for a repo.
pub fn index_resource(repo_root: &Path) -> String {
    format!("{}{}", constants::INDEX_RESOURCE_PREFIX, repo_root.display())
}

/// Index a batch of extracted files into the store.
///
/// Each file is committed in its own transaction, so cancelling between
/// files leaves every file either fully old or fully new. The run holds the
/// repo's index lock and stops early when cancelled or wounded; the status
/// is then left `stale` so the next run redoes the work.
pub fn index_files(
    conn: &Connection,
    repo_root: &Path,
    config: &Config,
    files: &[ExtractedFile],
    locks: &dyn LockService,
    task: &TaskIdentity,
    cancel: &AtomicBool,
) -> Result<IndexReport, StateError> {
    let started = Instant::now();
    let resource = index_resource(repo_root);
    let ttl = Duration::from_secs(config.locks.ttl_secs.max(1));
    let mut lease = HeldLock::acquire_for(locks, &resource, task, ttl)?;

    let status_path = config.index_status_path(repo_root);
    let previous = match index_status::read_status(&status_path) {
        StatusRead::Present(status) => Some(status),
        StatusRead::Missing => None,
        StatusRead::Malformed(reason) => {
            warn!(%reason, "ignoring malformed index status");
            None
        }
    };
    let recovered = previous
        .as_ref()
        .is_some_and(|status| status.index_state == IndexState::Rebuilding);
    if recovered {
        warn!(repo = %repo_root.display(), "previous indexing run did not finish; recovering");
    }

    let repo = repo_root.display().to_string();
    let mut status = previous.unwrap_or_else(|| IndexStatus::new(repo.clone(), IndexState::Stale));
    status.repo = repo;
    status.index_state = IndexState::Rebuilding;
    status.schema_version = constants::SCHEMA_VERSION;
    status.last_error = None;
    index_status::write_status(&status_path, &status)?;

    let outcome = run_batch(conn, repo_root, config, files, &mut lease, cancel);

    let result = match outcome {
        Ok(mut report) => {
            if report.interrupted {
                status.index_state = IndexState::Stale;
                status.last_error = Some("indexing interrupted before completion".to_string());
            } else {
                status.index_state = IndexState::Fresh;
                status.last_indexed_at = Some(spanlens_core::time::now_iso8601());
                status.last_indexed_commit = match spanlens_core::vcs::detect_head_commit(repo_root)
                {
                    Ok(commit) => Some(commit),
                    Err(err) => {
                        debug!(error = %err, "no VCS head recorded for index");
                        None
                    }
                };
            }
            index_status::write_status(&status_path, &status)?;
            report.recovered_interrupted_run = recovered;
            report.final_state = status.index_state;
            report.duration_ms = started.elapsed().as_millis() as u64;
            info!(
                files_indexed = report.files_indexed,
                files_removed = report.files_removed,
                spans_written = report.spans_written,
                interrupted = report.interrupted,
                duration_ms = report.duration_ms,
                "indexing run finished"
            );
            Ok(report)
        }
        Err(err) => {
            status.index_state = IndexState::Error;
            status.last_error = Some(err.to_string());
            if let Err(write_err) = index_status::write_status(&status_path, &status) {
                warn!(error = %write_err, "failed to record indexing error status");
            }
            Err(err)
        }
    };

    if let Err(err) = lease.release() {
        warn!(%resource, error = %err, "failed to release index lock");
    }
    result
}

fn run_batch(
    conn: &Connection,
    repo_root: &Path,
    config: &Config,
    files: &[ExtractedFile],
    lease: &mut HeldLock<'_>,
    cancel: &AtomicBool,
) -> Result<IndexReport, StateError> {
    let ignore = IgnoreRules::load(repo_root)?;
    let algorithm = config.index.hash_algorithm_typed();
    let mut report = IndexReport {
        files_indexed: 0,
        files_skipped: 0,
        files_removed: 0,
        spans_written: 0,
        spans_removed: 0,
        interrupted: false,
        recovered_interrupted_run: false,
        final_state: IndexState::Rebuilding,
        duration_ms: 0,
    };

    for file in files {
        if cancel.load(Ordering::SeqCst) {
            info!("indexing cancelled");
            report.interrupted = true;
            return Ok(report);
        }
        if !lease.renew()? {
            report.interrupted = true;
            return Ok(report);
        }

        match index_one(conn, repo_root, config, algorithm, &ignore, file)? {
            FileOutcome::Indexed(stats) => {
                report.files_indexed += 1;
                report.spans_written += stats.written;
                report.spans_removed += stats.removed;
            }
            FileOutcome::Skipped => report.files_skipped += 1,
            FileOutcome::Removed(spans) => {
                report.files_removed += 1;
                report.spans_removed += spans;
            }
        }
    }

    for path in files::list_file_paths(conn)? {
        if cancel.load(Ordering::SeqCst) {
            report.interrupted = true;
            return Ok(report);
        }
        if repo_root.join(&path).is_file() && !ignore.is_ignored(&path) {
            continue;
        }
        let removed = files::delete_file(conn, &path)?;
        debug!(%path, removed, "swept file no longer indexable");
        report.files_removed += 1;
        report.spans_removed += removed;
    }
    Ok(report)
}

fn normalize_rel_path(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches("./").to_string()
}

fn mtime_ns(metadata: &std::fs::Metadata) -> Option<i64> {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
}

fn remove_stale(conn: &Connection, rel: &str) -> Result<FileOutcome, StateError> {
    if files::get_file(conn, rel)?.is_none() {
        return Ok(FileOutcome::Skipped);
    }
    let removed = files::delete_file(conn, rel)?;
    Ok(FileOutcome::Removed(removed))
}

fn index_one(
    conn: &Connection,
    repo_root: &Path,
    config: &Config,
    algorithm: HashAlgorithm,
    ignore: &IgnoreRules,
    file: &ExtractedFile,
) -> Result<FileOutcome, StateError> {
    let rel = normalize_rel_path(&file.path);
    if ignore.is_ignored(&rel) {
        debug!(path = %rel, "skipped ignored file");
        return remove_stale(conn, &rel);
    }

    let abs = repo_root.join(&rel);
    let metadata = match std::fs::metadata(&abs) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %rel, "source file vanished; removing its spans");
            return remove_stale(conn, &rel);
        }
        Err(err) => {
            warn!(path = %rel, error = %err, "skipped unreadable file");
            return Ok(FileOutcome::Skipped);
        }
    };
    if metadata.len() > config.index.max_file_size {
        warn!(path = %rel, size = metadata.len(), "skipped: file too large");
        return remove_stale(conn, &rel);
    }

    let text = match std::fs::read_to_string(&abs) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %rel, "source file vanished; removing its spans");
            return remove_stale(conn, &rel);
        }
        Err(err) => {
            warn!(path = %rel, error = %err, "skipped non-text file");
            return Ok(FileOutcome::Skipped);
        }
    };

    let lines: Vec<&str> = text.lines().collect();
    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(file.spans.len());
    for draft in &file.spans {
        let Some(body) = slice_lines(&lines, draft.start_line, draft.end_line) else {
            warn!(
                path = %rel,
                symbol = %draft.symbol,
                start_line = draft.start_line,
                end_line = draft.end_line,
                "skipped span outside file bounds"
            );
            continue;
        };
        let hash = span_hash(
            algorithm,
            &rel,
            draft.start_line,
            draft.end_line,
            config.index.hash_include_text.then_some(body.as_str()),
        );
        if !seen.insert(hash.clone()) {
            continue;
        }
        records.push(SpanRecord {
            span: Span {
                file_path: rel.clone(),
                language: file.language.clone(),
                symbol: draft.symbol.clone(),
                kind: draft.kind.clone(),
                start_line: draft.start_line,
                end_line: draft.end_line,
                span_hash: hash,
            },
            text: body,
        });
    }

    let record = FileRecord {
        path: rel.clone(),
        language: file.language.clone(),
        content_hash: blake3::hash(text.as_bytes()).to_hex().to_string(),
        size_bytes: metadata.len(),
        mtime_ns: mtime_ns(&metadata),
        indexed_at: spanlens_core::time::now_iso8601(),
    };
    let stats = spans::replace_file_spans(conn, &record, &records)?;
    debug!(path = %rel, written = stats.written, removed = stats.removed, "file indexed");
    Ok(FileOutcome::Indexed(stats))
}

/// Lines `start..=end` (1-based). `None` when the range is empty or starts
/// past the end; an end past EOF is clamped.
fn slice_lines(lines: &[&str], start: u32, end: u32) -> Option<String> {
    if start == 0 || end < start || start as usize > lines.len() {
        return None;
    }
    let end = (end as usize).min(lines.len());
    Some(lines[start as usize - 1..end].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanlens_state::locks::{AcquireOutcome, FileLockService};
    use spanlens_state::{db, schema};
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        repo: std::path::PathBuf,
        conn: Connection,
        config: Config,
        locks: FileLockService,
    }

    fn fixture(files: &[(&str, &str)]) -> Fixture {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("repo");
        for (path, content) in files {
            let full = repo.join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
        let config = Config::default();
        let conn = db::open_connection(&config.index_db_path(&repo)).unwrap();
        schema::create_tables(&conn).unwrap();
        let locks = FileLockService::new(config.lock_dir(&repo), Duration::from_millis(50));
        Fixture {
            _dir: dir,
            repo,
            conn,
            config,
            locks,
        }
    }

    fn extracted(path: &str, spans: &[(&str, u32, u32)]) -> ExtractedFile {
        ExtractedFile {
            path: path.to_string(),
            language: "rust".to_string(),
            spans: spans
                .iter()
                .map(|(symbol, start, end)| SpanDraft {
                    symbol: symbol.to_string(),
                    kind: "function".to_string(),
                    start_line: *start,
                    end_line: *end,
                })
                .collect(),
        }
    }

    fn run(fx: &Fixture, files: &[ExtractedFile]) -> IndexReport {
        index_files(
            &fx.conn,
            &fx.repo,
            &fx.config,
            files,
            &fx.locks,
            &TaskIdentity::new("indexer-test", 100.0),
            &AtomicBool::new(false),
        )
        .unwrap()
    }

    #[test]
    fn indexes_spans_and_marks_status_fresh() {
        let fx = fixture(&[("src/a.rs", "fn a() {\n    1\n}\nfn b() {}\n")]);
        let report = run(&fx, &[extracted("src/a.rs", &[("a", 1, 3), ("b", 4, 4)])]);

        assert_eq!(report.files_indexed, 1);
        assert_eq!(report.spans_written, 2);
        assert_eq!(report.final_state, IndexState::Fresh);
        let stored = spans::spans_for_file(&fx.conn, "src/a.rs").unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].text, "fn a() {\n    1\n}");

        let status = index_status::read_status(&fx.config.index_status_path(&fx.repo))
            .into_status()
            .unwrap();
        assert_eq!(status.index_state, IndexState::Fresh);
        assert!(status.last_indexed_at.is_some());
        assert!(status.last_indexed_commit.is_none());
        assert!(fx.locks.current(&index_resource(&fx.repo)).unwrap().is_none());
    }

    #[test]
    fn reindexing_is_idempotent_and_drops_vanished_spans() {
        let fx = fixture(&[("a.rs", "fn a() {}\nfn b() {}\n")]);
        let first = run(&fx, &[extracted("a.rs", &[("a", 1, 1), ("b", 2, 2)])]);
        let hashes: Vec<String> = spans::spans_for_file(&fx.conn, "a.rs")
            .unwrap()
            .into_iter()
            .map(|r| r.span.span_hash)
            .collect();
        assert_eq!(first.spans_written, 2);

        let again = run(&fx, &[extracted("a.rs", &[("a", 1, 1)])]);
        assert_eq!(again.spans_removed, 1);
        let remaining = spans::spans_for_file(&fx.conn, "a.rs").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].span.span_hash, hashes[0]);
    }

    #[test]
    fn missing_files_are_removed_defensively() {
        let fx = fixture(&[("a.rs", "fn a() {}\n"), ("b.rs", "fn b() {}\n")]);
        run(
            &fx,
            &[
                extracted("a.rs", &[("a", 1, 1)]),
                extracted("b.rs", &[("b", 1, 1)]),
            ],
        );
        std::fs::remove_file(fx.repo.join("b.rs")).unwrap();

        let report = run(
            &fx,
            &[
                extracted("b.rs", &[("b", 1, 1)]),
                extracted("a.rs", &[("a", 1, 1)]),
            ],
        );
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.files_indexed, 1);
        assert!(spans::spans_for_file(&fx.conn, "b.rs").unwrap().is_empty());
        assert!(files::get_file(&fx.conn, "b.rs").unwrap().is_none());
    }

    #[test]
    fn sweep_removes_files_deleted_outside_the_batch() {
        let fx = fixture(&[("a.rs", "fn a() {}\n"), ("gone.rs", "fn g() {}\n")]);
        run(
            &fx,
            &[
                extracted("a.rs", &[("a", 1, 1)]),
                extracted("gone.rs", &[("g", 1, 1)]),
            ],
        );
        std::fs::remove_file(fx.repo.join("gone.rs")).unwrap();
        let report = run(&fx, &[extracted("a.rs", &[("a", 1, 1)])]);
        assert_eq!(report.files_removed, 1);
        assert_eq!(files::list_file_paths(&fx.conn).unwrap(), vec!["a.rs"]);
    }

    #[test]
    fn ignored_and_out_of_range_spans_are_skipped() {
        let fx = fixture(&[
            ("a.rs", "fn a() {}\n"),
            ("secret/key.rs", "fn k() {}\n"),
            (".spanlensignore", "secret/\n"),
        ]);
        let report = run(
            &fx,
            &[
                extracted("a.rs", &[("a", 1, 1), ("ghost", 5, 9), ("bad", 0, 1)]),
                extracted("secret/key.rs", &[("k", 1, 1)]),
            ],
        );
        assert_eq!(report.files_skipped, 1);
        assert_eq!(report.spans_written, 1);
        assert!(files::get_file(&fx.conn, "secret/key.rs").unwrap().is_none());
    }

    #[test]
    fn cancellation_leaves_status_stale() {
        let fx = fixture(&[("a.rs", "fn a() {}\n")]);
        let cancel = AtomicBool::new(true);
        let report = index_files(
            &fx.conn,
            &fx.repo,
            &fx.config,
            &[extracted("a.rs", &[("a", 1, 1)])],
            &fx.locks,
            &TaskIdentity::new("t", 100.0),
            &cancel,
        )
        .unwrap();
        assert!(report.interrupted);
        assert_eq!(report.final_state, IndexState::Stale);
        assert_eq!(spans::count_spans(&fx.conn).unwrap(), 0);
    }

    #[test]
    fn leftover_rebuilding_status_is_recovered() {
        let fx = fixture(&[("a.rs", "fn a() {}\n")]);
        let path = fx.config.index_status_path(&fx.repo);
        index_status::write_status(
            &path,
            &IndexStatus::new(fx.repo.display().to_string(), IndexState::Rebuilding),
        )
        .unwrap();

        let report = run(&fx, &[extracted("a.rs", &[("a", 1, 1)])]);
        assert!(report.recovered_interrupted_run);
        assert_eq!(report.final_state, IndexState::Fresh);
    }

    #[test]
    fn busy_index_lock_is_reported() {
        let fx = fixture(&[("a.rs", "fn a() {}\n")]);
        let resource = index_resource(&fx.repo);
        let held = fx
            .locks
            .acquire(&resource, "other", Duration::from_secs(60), 1.0)
            .unwrap();
        assert!(matches!(held, AcquireOutcome::Granted(_)));

        let err = index_files(
            &fx.conn,
            &fx.repo,
            &fx.config,
            &[extracted("a.rs", &[("a", 1, 1)])],
            &fx.locks,
            &TaskIdentity::new("t", 100.0),
            &AtomicBool::new(false),
        )
        .unwrap_err();
        assert!(matches!(err, StateError::ResourceBusy { .. }));
    }

    #[test]
    fn fresh_status_records_git_head() {
        let fx = fixture(&[("a.rs", "fn a() {}\n")]);
        let repo = git2::Repository::init(&fx.repo).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("a.rs")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("t", "t@example.com").unwrap();
        let oid = repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[]).unwrap();

        run(&fx, &[extracted("a.rs", &[("a", 1, 1)])]);
        let status = index_status::read_status(&fx.config.index_status_path(&fx.repo))
            .into_status()
            .unwrap();
        assert_eq!(status.last_indexed_commit, Some(oid.to_string()));
    }

    #[test]
    fn slice_lines_clamps_end_and_rejects_bad_ranges() {
        let lines = vec!["a", "b", "c"];
        assert_eq!(slice_lines(&lines, 2, 10).as_deref(), Some("b\nc"));
        assert_eq!(slice_lines(&lines, 0, 1), None);
        assert_eq!(slice_lines(&lines, 3, 2), None);
        assert_eq!(slice_lines(&lines, 4, 4), None);
    }
}
