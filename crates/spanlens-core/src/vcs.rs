use crate::error::VcsError;
use std::path::Path;

/// Full hex id of the commit HEAD points at.
pub fn detect_head_commit(repo_root: &Path) -> Result<String, VcsError> {
    let repo = git2::Repository::open(repo_root).map_err(|_| VcsError::NotGitRepo {
        path: repo_root.display().to_string(),
    })?;

    let head = repo
        .head()
        .map_err(|e| VcsError::GitError(format!("Failed to read HEAD: {}", e)))?;

    let commit = head
        .peel_to_commit()
        .map_err(|e| VcsError::GitError(format!("Failed to peel to commit: {}", e)))?;

    Ok(commit.id().to_string())
}
