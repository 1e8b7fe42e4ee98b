//! The task runner ties snapshots, requirements, the result cache and a
//! backend together.
//!
//! A run goes snapshot, requirements, fingerprint, cache lookup, then
//! prepare and execute on a miss. Concurrent misses on the same fingerprint
//! are serialized: the second caller waits for the first and then finds the
//! stored result instead of executing again.

use crate::backend::{self, Backend};
use crate::cache::{self, ResultCache};
use crate::config::Settings;
use crate::errors::{PinrunError, Result};
use crate::keyed_lock::KeyedLocks;
use crate::requirements::{self, RequirementsSet};
use crate::snapshot::{PullOptions, RepoRef, Snapshot, SnapshotManager};
use crate::task::{Task, TaskResult};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

pub struct TaskRunner {
    settings: Settings,
    base_dir: PathBuf,
    snapshots: SnapshotManager,
    backend: Arc<dyn Backend>,
    cache: ResultCache,
    locks: KeyedLocks,
}

impl TaskRunner {
    /// Validates `settings`, checks the cache and builds the configured backend.
    pub async fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let base_dir = absolute_base_dir(&settings.base_dir).await?;
        let cache = ResultCache::checked(&settings.cache, settings.ignore_cache_errors).await?;
        let backend = backend::from_config(&settings, &base_dir)?;
        Ok(Self::assemble(settings, base_dir, backend, cache))
    }

    /// Like [`TaskRunner::new`] but runs tasks with `backend`, ignoring the backend settings.
    pub async fn with_backend(settings: Settings, backend: Arc<dyn Backend>) -> Result<Self> {
        settings.validate()?;
        let base_dir = absolute_base_dir(&settings.base_dir).await?;
        let cache = ResultCache::checked(&settings.cache, settings.ignore_cache_errors).await?;
        Ok(Self::assemble(settings, base_dir, backend, cache))
    }

    fn assemble(settings: Settings, base_dir: PathBuf, backend: Arc<dyn Backend>, cache: ResultCache) -> Self {
        log::info!(
            "Task runner in {} with the {} backend, cache {}",
            base_dir.display(),
            backend.name(),
            if cache.is_enabled() { "enabled" } else { "disabled" }
        );
        Self {
            snapshots: SnapshotManager::new(&base_dir, settings.single_pull),
            settings,
            base_dir,
            backend,
            cache,
            locks: KeyedLocks::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Runs `task` against the head of `branch`, cloning shallowly on first use.
    pub async fn run(&self, repo: &str, branch: &str, task: &Task) -> Result<TaskResult> {
        self.run_with(repo, branch, task, &PullOptions::default()).await
    }

    pub async fn run_with(
        &self,
        repo: &str,
        branch: &str,
        task: &Task,
        options: &PullOptions,
    ) -> Result<TaskResult> {
        let snapshot = self.snapshot_with(repo, branch, options).await?;
        let requirements = self.requirements(&snapshot).await?;
        let fingerprint = self.fingerprint_of(&snapshot, task, &requirements);

        if let Some(result) = self.cached(&fingerprint).await? {
            return Ok(result);
        }

        let _guard = if self.cache.is_enabled() {
            let guard = self.locks.lock(&fingerprint).await;
            // Whoever held the lock may have just stored it.
            if let Some(result) = self.cached(&fingerprint).await? {
                return Ok(result);
            }
            Some(guard)
        } else {
            None
        };

        let context = self.backend.prepare(&snapshot, &requirements).await?;
        let result = self.backend.execute(&context, &snapshot, task).await?;

        if let Err(e) = self.cache.put(&fingerprint, &result).await {
            if !self.settings.ignore_cache_errors {
                return Err(e);
            }
            log::warn!("Could not store result for {}: {}", fingerprint, e);
        }
        Ok(result)
    }

    /// Absolute path of `relative` inside the working copy of `branch`.
    pub async fn static_filename(
        &self,
        repo: &str,
        branch: &str,
        relative: impl AsRef<Path>,
    ) -> Result<PathBuf> {
        let snapshot = self.snapshot(repo, branch).await?;
        resolve_inside(&snapshot.local_path, relative.as_ref())
    }

    pub async fn snapshot(&self, repo: &str, branch: &str) -> Result<Snapshot> {
        self.snapshot_with(repo, branch, &PullOptions::default()).await
    }

    async fn snapshot_with(&self, repo: &str, branch: &str, options: &PullOptions) -> Result<Snapshot> {
        let repo_ref = RepoRef::new(repo, branch)?;
        self.snapshots.snapshot(&repo_ref, options).await
    }

    /// Forgets pinned commits so the next run fetches again. Only matters with single-pull.
    pub fn pull_again(&self, repo: Option<&str>, branch: Option<&str>) -> Result<()> {
        self.snapshots.invalidate(repo, branch)
    }

    pub async fn current_commit(&self, repo: &str, branch: &str) -> Result<String> {
        Ok(self.snapshot(repo, branch).await?.commit_id)
    }

    /// Cache key `task` would be stored under if it ran now.
    pub async fn fingerprint(&self, repo: &str, branch: &str, task: &Task) -> Result<String> {
        let snapshot = self.snapshot(repo, branch).await?;
        let requirements = self.requirements(&snapshot).await?;
        Ok(self.fingerprint_of(&snapshot, task, &requirements))
    }

    /// Tears down kept containers and VMs.
    pub async fn stop(&self) -> Result<()> {
        log::info!("Stopping the {} backend", self.backend.name());
        self.backend.teardown().await
    }

    async fn requirements(&self, snapshot: &Snapshot) -> Result<RequirementsSet> {
        let common = self.backend.common();
        requirements::resolve(
            &snapshot.local_path,
            common.requirements_location.as_deref(),
            common.lockfile_location.as_deref(),
        )
        .await
    }

    fn fingerprint_of(&self, snapshot: &Snapshot, task: &Task, requirements: &RequirementsSet) -> String {
        cache::fingerprint(
            &snapshot.commit_id,
            task,
            &self.backend.identity(),
            requirements.resolved_hash(),
        )
    }

    async fn cached(&self, fingerprint: &str) -> Result<Option<TaskResult>> {
        match self.cache.get(fingerprint).await {
            Ok(result) => Ok(result),
            Err(e) if self.settings.ignore_cache_errors => {
                log::warn!("Cache lookup for {} failed: {}", fingerprint, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Creates `dir` if needed and returns its absolute form.
async fn absolute_base_dir(dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        PinrunError::Configuration(format!("Cannot create base directory {}: {}", dir.display(), e))
    })?;
    Ok(tokio::fs::canonicalize(dir).await?)
}

fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Resolves `relative` against `root` (itself canonical), following symlinks,
/// and refuses anything that ends up outside `root`.
pub(crate) fn resolve_inside(root: &Path, relative: &Path) -> Result<PathBuf> {
    let candidate = root.join(relative);
    match candidate.canonicalize() {
        Ok(resolved) => {
            if !resolved.starts_with(root) {
                return Err(PinrunError::FileOutOfRange(relative.to_path_buf()));
            }
            if !resolved.is_file() {
                return Err(PinrunError::FileNotFound(relative.to_path_buf()));
            }
            Ok(resolved)
        }
        Err(_) => {
            // Nothing there; decide between out of range and not found on the
            // closest existing ancestor, which may itself be a symlink.
            let normalized = normalize(&candidate);
            let mut existing = normalized.as_path();
            while !existing.exists() {
                existing = match existing.parent() {
                    Some(parent) => parent,
                    None => break,
                };
            }
            let anchored = existing
                .canonicalize()
                .map(|real| real.join(normalized.strip_prefix(existing).unwrap_or(Path::new(""))))
                .unwrap_or(normalized.clone());
            if anchored.starts_with(root) {
                Err(PinrunError::FileNotFound(relative.to_path_buf()))
            } else {
                Err(PinrunError::FileOutOfRange(relative.to_path_buf()))
            }
        }
    }
}
