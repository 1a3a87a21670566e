use ignore::gitignore::{Gitignore, GitignoreBuilder};
use spanlens_core::constants;
use spanlens_core::error::StateError;
use std::path::Path;
use tracing::debug;

/// Gitignore-equivalent matcher over repo-relative paths.
///
/// Combines the repo's `.gitignore` with `.spanlensignore`; later files win,
/// so `!pattern` in `.spanlensignore` can re-include a gitignored path.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    matcher: Option<Gitignore>,
}

impl IgnoreRules {
    /// Rules that ignore nothing.
    pub fn empty() -> Self {
        Self { matcher: None }
    }

    pub fn load(repo_root: &Path) -> Result<Self, StateError> {
        let mut builder = GitignoreBuilder::new(repo_root);
        let mut any = false;
        for name in [".gitignore", constants::IGNORE_FILE] {
            let path = repo_root.join(name);
            if !path.is_file() {
                continue;
            }
            if let Some(err) = builder.add(&path) {
                return Err(StateError::IgnoreRule(format!("{}: {err}", path.display())));
            }
            any = true;
        }
        if !any {
            return Ok(Self::empty());
        }
        let matcher = builder
            .build()
            .map_err(|e| StateError::IgnoreRule(e.to_string()))?;
        debug!(rules = matcher.num_ignores(), "ignore rules loaded");
        Ok(Self {
            matcher: Some(matcher),
        })
    }

    pub fn from_patterns(repo_root: &Path, patterns: &[&str]) -> Result<Self, StateError> {
        let mut builder = GitignoreBuilder::new(repo_root);
        for pattern in patterns {
            builder
                .add_line(None, pattern)
                .map_err(|e| StateError::IgnoreRule(e.to_string()))?;
        }
        let matcher = builder
            .build()
            .map_err(|e| StateError::IgnoreRule(e.to_string()))?;
        Ok(Self {
            matcher: Some(matcher),
        })
    }

    /// Whether a repo-relative file path (or one of its parent directories) is ignored.
    pub fn is_ignored(&self, rel_path: &str) -> bool {
        let Some(matcher) = &self.matcher else {
            return false;
        };
        let normalized = rel_path.replace('\\', "/");
        let trimmed = normalized.trim_start_matches("./").trim_start_matches('/');
        if trimmed.is_empty() {
            return false;
        }
        matcher
            .matched_path_or_any_parents(Path::new(trimmed), false)
            .is_ignore()
    }
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_rules_ignore_nothing() {
        assert!(!IgnoreRules::empty().is_ignored("target/debug/x.rs"));
    }

    #[test]
    fn patterns_match_files_and_parent_dirs() {
        let dir = tempdir().unwrap();
        let rules = IgnoreRules::from_patterns(dir.path(), &["vendor/", "*.min.js"]).unwrap();
        assert!(rules.is_ignored("vendor/lib/a.rs"));
        assert!(rules.is_ignored("web/app.min.js"));
        assert!(rules.is_ignored("./web/app.min.js"));
        assert!(!rules.is_ignored("src/main.rs"));
    }

    #[test]
    fn load_combines_gitignore_and_tool_ignore() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "build/\nsecret.txt\n").unwrap();
        std::fs::write(dir.path().join(constants::IGNORE_FILE), "docs/\n!secret.txt\n").unwrap();

        let rules = IgnoreRules::load(dir.path()).unwrap();
        assert!(rules.is_ignored("build/out.rs"));
        assert!(rules.is_ignored("docs/guide.md"));
        assert!(!rules.is_ignored("secret.txt"));
        assert!(!rules.is_ignored("src/lib.rs"));
    }

    #[test]
    fn load_without_ignore_files_is_empty() {
        let dir = tempdir().unwrap();
        let rules = IgnoreRules::load(dir.path()).unwrap();
        assert!(!rules.is_ignored("anything.rs"));
    }
}
