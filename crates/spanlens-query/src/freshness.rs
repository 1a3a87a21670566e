use serde::Serialize;
use spanlens_core::types::{FreshnessState, IndexState};
use spanlens_state::index_status::{self, IndexStatus, StatusRead};
use std::path::Path;
use tracing::debug;

/// Outcome of the repo-level freshness gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FreshnessReport {
    pub state: FreshnessState,
    pub use_index: bool,
    pub index_state: Option<IndexState>,
    pub last_indexed_at: Option<String>,
    pub last_indexed_commit: Option<String>,
    pub current_head: Option<String>,
    pub reason: String,
}

/// Map an index state and HEAD comparison to a freshness decision.
///
/// `head_matches` is `None` when the comparison could not be made (no
/// recorded commit, no repository, unreadable HEAD).
pub fn classify(index_state: Option<IndexState>, head_matches: Option<bool>) -> (FreshnessState, bool) {
    match (index_state, head_matches) {
        (Some(IndexState::Fresh), Some(true)) => (FreshnessState::Fresh, true),
        (Some(IndexState::Fresh), Some(false)) => (FreshnessState::Stale, false),
        (Some(IndexState::Fresh), None) => (FreshnessState::Unknown, false),
        (Some(IndexState::Stale | IndexState::Error), _) => (FreshnessState::Stale, false),
        (Some(IndexState::Rebuilding), _) | (None, _) => (FreshnessState::Unknown, false),
    }
}

/// Read the status file and compare the recorded commit with HEAD.
pub fn check_freshness(status_path: &Path, repo_root: &Path) -> FreshnessReport {
    let status = match index_status::read_status(status_path) {
        StatusRead::Present(status) => status,
        StatusRead::Missing => return unknown("index status missing"),
        StatusRead::Malformed(reason) => return unknown(&format!("index status malformed: {reason}")),
    };
    let current_head = match spanlens_core::vcs::detect_head_commit(repo_root) {
        Ok(head) => Some(head),
        Err(err) => {
            debug!(error = %err, "HEAD unavailable for freshness check");
            None
        }
    };
    report_for(status, current_head)
}

fn unknown(reason: &str) -> FreshnessReport {
    FreshnessReport {
        state: FreshnessState::Unknown,
        use_index: false,
        index_state: None,
        last_indexed_at: None,
        last_indexed_commit: None,
        current_head: None,
        reason: reason.to_string(),
    }
}

fn report_for(status: IndexStatus, current_head: Option<String>) -> FreshnessReport {
    let head_matches = match (&status.last_indexed_commit, &current_head) {
        (Some(recorded), Some(head)) => Some(recorded == head),
        _ => None,
    };
    let (state, use_index) = classify(Some(status.index_state), head_matches);
    let reason = match (status.index_state, head_matches) {
        (IndexState::Fresh, Some(true)) => "index matches HEAD".to_string(),
        (IndexState::Fresh, Some(false)) => "HEAD moved since last index".to_string(),
        (IndexState::Fresh, None) => "cannot compare index commit with HEAD".to_string(),
        (IndexState::Rebuilding, _) => "index rebuild in progress".to_string(),
        (IndexState::Error, _) => match &status.last_error {
            Some(error) => format!("last indexing run failed: {error}"),
            None => "last indexing run failed".to_string(),
        },
        (IndexState::Stale, _) => "index marked stale".to_string(),
    };
    FreshnessReport {
        state,
        use_index,
        index_state: Some(status.index_state),
        last_indexed_at: status.last_indexed_at,
        last_indexed_commit: status.last_indexed_commit,
        current_head,
        reason,
    }
}

/// Per-file guard decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileFreshness {
    Current,
    ModifiedSinceIndex,
    /// The mtime or index timestamp could not be established.
    Unverifiable(String),
}

impl FileFreshness {
    /// Only a file proven unchanged may be served from the index.
    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Current)
    }
}

/// Compare one file's modification time with the index timestamp.
///
/// Symlinks are followed to their target; a dangling link or unreadable
/// file is unverifiable and therefore unsafe.
pub fn check_file_freshness(path: &Path, last_indexed_at: Option<&str>) -> FileFreshness {
    let Some(indexed_at) = last_indexed_at.and_then(spanlens_core::time::parse_iso8601) else {
        return FileFreshness::Unverifiable("index timestamp missing or unparseable".to_string());
    };
    let modified = match std::fs::metadata(path).and_then(|metadata| metadata.modified()) {
        Ok(modified) => modified,
        Err(err) => return FileFreshness::Unverifiable(err.to_string()),
    };
    if spanlens_core::time::system_time_to_offset(modified) > indexed_at {
        FileFreshness::ModifiedSinceIndex
    } else {
        FileFreshness::Current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const ALL_STATES: [IndexState; 4] = [
        IndexState::Fresh,
        IndexState::Stale,
        IndexState::Rebuilding,
        IndexState::Error,
    ];

    fn commit_file(repo: &git2::Repository, name: &str, content: &str) -> String {
        let root = repo.workdir().unwrap();
        std::fs::write(root.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("t", "t@example.com").unwrap();
        let parents: Vec<git2::Commit<'_>> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, name, &tree, &parent_refs)
            .unwrap()
            .to_string()
    }

    fn write_status(path: &Path, state: IndexState, commit: Option<&str>) {
        let mut status = IndexStatus::new("/repo", state);
        status.last_indexed_commit = commit.map(str::to_string);
        status.last_indexed_at = Some(spanlens_core::time::now_iso8601());
        index_status::write_status(path, &status).unwrap();
    }

    #[test]
    fn classification_table() {
        for state in ALL_STATES {
            for head in [Some(true), Some(false), None] {
                let expected = match (state, head) {
                    (IndexState::Fresh, Some(true)) => (FreshnessState::Fresh, true),
                    (IndexState::Fresh, Some(false)) => (FreshnessState::Stale, false),
                    (IndexState::Stale | IndexState::Error, _) => (FreshnessState::Stale, false),
                    _ => (FreshnessState::Unknown, false),
                };
                assert_eq!(classify(Some(state), head), expected, "{state:?} {head:?}");
            }
        }
        assert_eq!(classify(None, Some(true)), (FreshnessState::Unknown, false));
    }

    #[test]
    fn fresh_index_tracks_head() {
        let dir = tempdir().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        let first = commit_file(&repo, "a.rs", "fn a() {}\n");
        let status_path = dir.path().join(".spanlens").join("index_status.json");

        write_status(&status_path, IndexState::Fresh, Some(&first));
        let report = check_freshness(&status_path, dir.path());
        assert_eq!(report.state, FreshnessState::Fresh);
        assert!(report.use_index);

        commit_file(&repo, "b.rs", "fn b() {}\n");
        let report = check_freshness(&status_path, dir.path());
        assert_eq!(report.state, FreshnessState::Stale);
        assert!(!report.use_index);
        assert_eq!(report.last_indexed_commit.as_deref(), Some(first.as_str()));
    }

    #[test]
    fn non_fresh_states_never_use_index() {
        let dir = tempdir().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        let head = commit_file(&repo, "a.rs", "fn a() {}\n");
        let status_path = dir.path().join("status.json");
        for (state, expected) in [
            (IndexState::Stale, FreshnessState::Stale),
            (IndexState::Error, FreshnessState::Stale),
            (IndexState::Rebuilding, FreshnessState::Unknown),
        ] {
            write_status(&status_path, state, Some(&head));
            let report = check_freshness(&status_path, dir.path());
            assert_eq!(report.state, expected, "{state:?}");
            assert!(!report.use_index);
        }
    }

    #[test]
    fn missing_or_malformed_status_is_unknown() {
        let dir = tempdir().unwrap();
        let status_path = dir.path().join("status.json");
        assert_eq!(check_freshness(&status_path, dir.path()).state, FreshnessState::Unknown);

        std::fs::write(&status_path, "{not json").unwrap();
        let report = check_freshness(&status_path, dir.path());
        assert_eq!(report.state, FreshnessState::Unknown);
        assert!(!report.use_index);
    }

    #[test]
    fn fresh_status_outside_git_is_unknown() {
        let dir = tempdir().unwrap();
        let status_path = dir.path().join("status.json");
        write_status(&status_path, IndexState::Fresh, Some("abc"));
        let report = check_freshness(&status_path, dir.path());
        assert_eq!(report.state, FreshnessState::Unknown);
        assert!(!report.use_index);
    }

    #[test]
    fn file_guard_compares_mtime_with_index_time() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.rs");
        std::fs::write(&file, "fn a() {}\n").unwrap();

        assert_eq!(
            check_file_freshness(&file, Some("2000-01-01T00:00:00Z")),
            FileFreshness::ModifiedSinceIndex
        );
        assert!(check_file_freshness(&file, Some("2999-01-01T00:00:00Z")).is_safe());
        assert!(!check_file_freshness(&file, None).is_safe());
        assert!(!check_file_freshness(&file, Some("yesterday")).is_safe());
        assert!(!check_file_freshness(&dir.path().join("missing.rs"), Some("2999-01-01T00:00:00Z")).is_safe());
    }

    #[cfg(unix)]
    #[test]
    fn file_guard_follows_symlinks_and_fails_closed_on_broken_links() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target.rs");
        std::fs::write(&target, "fn t() {}\n").unwrap();
        let link = dir.path().join("link.rs");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        assert!(check_file_freshness(&link, Some("2999-01-01T00:00:00Z")).is_safe());

        let dangling = dir.path().join("dangling.rs");
        std::os::unix::fs::symlink(dir.path().join("nowhere.rs"), &dangling).unwrap();
        assert!(matches!(
            check_file_freshness(&dangling, Some("2999-01-01T00:00:00Z")),
            FileFreshness::Unverifiable(_)
        ));
    }
}
