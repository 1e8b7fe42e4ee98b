//! Commit-pinned working copies of repository branches
//!
//! Every branch of every repository gets its own working copy under
//! `<base_dir>/repos/<repo_id>/<branch>`. The first clone of a branch borrows
//! objects from an existing sibling branch when one is available. Later calls
//! either fetch and hard-reset (default) or, with single-pull, return the
//! snapshot captured the first time until it is invalidated.

pub mod git;

use crate::errors::{PinrunError, Result};
use crate::keyed_lock::KeyedLocks;
use chrono::{DateTime, Utc};
use git::Git;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

fn url_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"^(https?|file)://[\w.\-/~]+/?$").expect("static URL pattern is valid")
    })
}

fn branch_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._/\-]*$").expect("static branch pattern is valid")
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub url: String,
    pub branch: String,
}

impl RepoRef {
    pub fn new(url: impl Into<String>, branch: impl Into<String>) -> Result<Self> {
        let repo_ref = Self {
            url: url.into(),
            branch: branch.into(),
        };
        validate_url(&repo_ref.url)?;
        validate_branch(&repo_ref.branch)?;
        Ok(repo_ref)
    }

    pub fn repo_id(&self) -> String {
        repo_id(&self.url)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub repo_ref: RepoRef,
    pub repo_id: String,
    pub commit_id: String,
    pub local_path: PathBuf,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn short_commit(&self) -> &str {
        let end = self.commit_id.len().min(7);
        &self.commit_id[..end]
    }
}

/// How a branch is cloned the first time.
#[derive(Debug, Clone, PartialEq)]
pub struct PullOptions {
    /// Commits of history to fetch; `None` clones everything.
    pub depth: Option<u32>,
    /// Local clone of a related repository to borrow objects from.
    pub reference: Option<PathBuf>,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            depth: Some(1),
            reference: None,
        }
    }
}

impl PullOptions {
    pub fn full_history() -> Self {
        Self {
            depth: None,
            reference: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.depth == Some(0) {
            return Err(PinrunError::Configuration(
                "Clone depth must be a positive number".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn validate_url(url: &str) -> Result<()> {
    if !url_pattern().is_match(url) {
        return Err(PinrunError::Configuration(format!(
            "{} is not a valid http[s] or file:// git repository",
            url
        )));
    }
    Ok(())
}

fn validate_branch(branch: &str) -> Result<()> {
    if !branch_pattern().is_match(branch) || branch.contains("..") || branch.ends_with('/') {
        return Err(PinrunError::Configuration(format!(
            "'{}' is not a usable branch name",
            branch
        )));
    }
    Ok(())
}

/// Directory name for a repository: a readable slug plus the hash of the full URL.
pub fn repo_id(url: &str) -> String {
    static SCHEME: OnceLock<regex::Regex> = OnceLock::new();
    static SUFFIX: OnceLock<regex::Regex> = OnceLock::new();
    static INVALID: OnceLock<regex::Regex> = OnceLock::new();

    let scheme = SCHEME.get_or_init(|| {
        regex::Regex::new(r"^(https?://(www\.)?|file://)").expect("static scheme pattern is valid")
    });
    let suffix =
        SUFFIX.get_or_init(|| regex::Regex::new(r"\.git/?$").expect("static suffix pattern is valid"));
    let invalid = INVALID
        .get_or_init(|| regex::Regex::new(r"[^a-zA-Z0-9._]+").expect("static slug pattern is valid"));

    let slug = scheme.replace(url, "");
    let slug = suffix.replace(&slug, "");
    let slug = invalid.replace_all(&slug, "_");

    format!("{}{:x}", slug, Sha256::digest(url.as_bytes()))
}

#[derive(Debug)]
pub struct SnapshotManager {
    repos_dir: PathBuf,
    single_pull: bool,
    git: Git,
    locks: KeyedLocks,
    // repo_id -> branch -> snapshot, only populated in single-pull mode
    pinned: Mutex<HashMap<String, HashMap<String, Snapshot>>>,
}

impl SnapshotManager {
    pub fn new(base_dir: &Path, single_pull: bool) -> Self {
        Self::with_git(base_dir, single_pull, Git::default())
    }

    pub fn with_git(base_dir: &Path, single_pull: bool, git: Git) -> Self {
        Self {
            repos_dir: base_dir.join("repos"),
            single_pull,
            git,
            locks: KeyedLocks::new(),
            pinned: Mutex::new(HashMap::new()),
        }
    }

    pub fn single_pull(&self) -> bool {
        self.single_pull
    }

    pub fn repo_path(&self, url: &str) -> PathBuf {
        self.repos_dir.join(repo_id(url))
    }

    pub fn branch_path(&self, url: &str, branch: &str) -> PathBuf {
        self.repo_path(url).join(branch)
    }

    /// Commit-pinned working copy of `repo_ref`, cloning or refreshing it as the pull policy demands.
    pub async fn snapshot(&self, repo_ref: &RepoRef, options: &PullOptions) -> Result<Snapshot> {
        validate_url(&repo_ref.url)?;
        validate_branch(&repo_ref.branch)?;
        options.validate()?;

        let repo_id = repo_ref.repo_id();
        let _guard = self
            .locks
            .lock(&format!("{}/{}", repo_id, repo_ref.branch))
            .await;

        let path = self.branch_path(&repo_ref.url, &repo_ref.branch);
        log::info!("Repository {} branch {} is stored at {}", repo_ref.url, repo_ref.branch, path.display());

        if self.single_pull && path.exists() {
            if let Some(snapshot) = self.pinned_snapshot(&repo_id, &repo_ref.branch) {
                log::info!("Single pull enabled, reusing commit {}", snapshot.commit_id);
                return Ok(snapshot);
            }
        }

        if path.exists() {
            log::info!("Fetching {} into existing working copy", repo_ref.branch);
            self.git.fetch_and_reset(&path, &repo_ref.branch).await?;
        } else {
            self.clone_branch(repo_ref, &path, options).await?;
        }

        let snapshot = Snapshot {
            repo_ref: repo_ref.clone(),
            repo_id: repo_id.clone(),
            commit_id: self.git.head(&path).await?,
            local_path: tokio::fs::canonicalize(&path).await?,
            captured_at: Utc::now(),
        };

        if self.single_pull {
            self.lock_pinned()
                .entry(repo_id)
                .or_default()
                .insert(repo_ref.branch.clone(), snapshot.clone());
        }

        Ok(snapshot)
    }

    async fn clone_branch(&self, repo_ref: &RepoRef, path: &Path, options: &PullOptions) -> Result<()> {
        let parent = path.parent().unwrap_or(self.repos_dir.as_path());
        tokio::fs::create_dir_all(parent).await?;

        let reference = match &options.reference {
            Some(reference) if git::is_shallow(reference) => {
                log::warn!("Reference {} is a shallow clone, not using it", reference.display());
                None
            }
            Some(reference) => Some(reference.clone()),
            None => self.sibling_reference(&repo_ref.url, &repo_ref.branch),
        };
        let reference = match reference {
            Some(reference) => match tokio::fs::canonicalize(&reference).await {
                Ok(absolute) => Some(absolute),
                Err(_) => Some(reference),
            },
            None => None,
        };

        log::info!(
            "Initial clone of {} branch {} (depth {:?}, reference {:?})",
            repo_ref.url,
            repo_ref.branch,
            options.depth,
            reference
        );

        let cloned = self
            .git
            .clone_branch(&repo_ref.url, &repo_ref.branch, path, options.depth, reference.as_deref())
            .await;
        if cloned.is_err() && path.exists() {
            // A half-written clone would be mistaken for a working copy next time.
            tokio::fs::remove_dir_all(path).await?;
        }
        cloned
    }

    /// Another branch of the same repository whose objects a new clone can borrow.
    fn sibling_reference(&self, url: &str, branch: &str) -> Option<PathBuf> {
        let own = self.branch_path(url, branch);
        let entries = std::fs::read_dir(self.repo_path(url)).ok()?;
        entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| *path != own)
            .find(|path| git::is_working_copy(path) && !git::is_shallow(path))
    }

    fn pinned_snapshot(&self, repo_id: &str, branch: &str) -> Option<Snapshot> {
        self.lock_pinned()
            .get(repo_id)
            .and_then(|branches| branches.get(branch))
            .cloned()
    }

    /// Forget pinned snapshots: one branch, one repository, or everything.
    pub fn invalidate(&self, repo: Option<&str>, branch: Option<&str>) -> Result<()> {
        let mut pinned = self.lock_pinned();
        match (repo, branch) {
            (None, Some(_)) => {
                return Err(PinrunError::Configuration(
                    "A branch cannot be pulled again without its repository".to_string(),
                ))
            }
            (None, None) => pinned.clear(),
            (Some(url), None) => {
                pinned.remove(&repo_id(url));
            }
            (Some(url), Some(branch)) => {
                if let Some(branches) = pinned.get_mut(&repo_id(url)) {
                    branches.remove(branch);
                }
            }
        }
        Ok(())
    }

    fn lock_pinned(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, Snapshot>>> {
        self.pinned.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validation() {
        assert!(validate_url("https://github.com/user/repo.git").is_ok());
        assert!(validate_url("http://example.com/repo").is_ok());
        assert!(validate_url("file:///tmp/some_repo/").is_ok());
        assert!(validate_url("git@github.com:user/repo.git").is_err());
        assert!(validate_url("ssh://host/repo").is_err());
        assert!(validate_url("https://example.com/repo; rm -rf /").is_err());
        assert!(validate_url("").is_err());
    }

    #[test]
    fn test_branch_validation() {
        assert!(RepoRef::new("https://example.com/repo", "master").is_ok());
        assert!(RepoRef::new("https://example.com/repo", "feature/x-1").is_ok());
        assert!(RepoRef::new("https://example.com/repo", "-delete").is_err());
        assert!(RepoRef::new("https://example.com/repo", "../escape").is_err());
        assert!(RepoRef::new("https://example.com/repo", "").is_err());
    }

    #[test]
    fn test_repo_id_is_readable_and_unique() {
        let id = repo_id("https://github.com/user/repo.git");
        assert!(id.starts_with("github.com_user_repo"));
        assert_eq!(id.len(), "github.com_user_repo".len() + 64);

        assert_ne!(
            repo_id("https://github.com/user/repo.git"),
            repo_id("https://github.com/user/repo")
        );
        assert!(repo_id("file:///tmp/x/y").starts_with("_tmp_x_y"));
    }

    #[test]
    fn test_depth_must_be_positive() {
        let options = PullOptions {
            depth: Some(0),
            reference: None,
        };
        assert!(options.validate().is_err());
        assert!(PullOptions::default().validate().is_ok());
        assert!(PullOptions::full_history().validate().is_ok());
    }

    #[test]
    fn test_short_commit() {
        let snapshot = Snapshot {
            repo_ref: RepoRef::new("https://example.com/repo", "master").unwrap(),
            repo_id: repo_id("https://example.com/repo"),
            commit_id: "0123456789abcdef".to_string(),
            local_path: PathBuf::from("/tmp"),
            captured_at: Utc::now(),
        };
        assert_eq!(snapshot.short_commit(), "0123456");
    }

    #[test]
    fn test_invalidate_requires_repo_for_branch() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path(), true);
        assert!(matches!(
            manager.invalidate(None, Some("master")),
            Err(PinrunError::Configuration(_))
        ));
        assert!(manager.invalidate(None, None).is_ok());
        assert!(manager.invalidate(Some("https://example.com/repo"), None).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_url_rejected_before_touching_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path(), false);
        let repo_ref = RepoRef {
            url: "not a url".to_string(),
            branch: "master".to_string(),
        };
        let err = manager.snapshot(&repo_ref, &PullOptions::default()).await.unwrap_err();
        assert!(matches!(err, PinrunError::Configuration(_)));
        assert!(!dir.path().join("repos").exists());
    }

    #[tokio::test]
    async fn test_unreachable_repository_is_repository_error() {
        if which::which("git").is_err() {
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path(), false);
        let repo_ref = RepoRef::new("file:///nonexistent/pinrun/repo", "master").unwrap();
        let err = manager.snapshot(&repo_ref, &PullOptions::default()).await.unwrap_err();
        assert!(matches!(err, PinrunError::Repository(_)));
        assert!(!manager.branch_path(&repo_ref.url, "master").exists());
    }
}
