#![allow(dead_code)]

use async_trait::async_trait;
use pinrun_core::backend::{Backend, ExecutionContext};
use pinrun_core::config::CommonBackendConfig;
use pinrun_core::errors::{PinrunError, Result};
use pinrun_core::requirements::RequirementsSet;
use pinrun_core::snapshot::Snapshot;
use pinrun_core::task::{Task, TaskResult};
use serde_json::json;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

pub fn git_available() -> bool {
    which::which("git").is_ok()
}

pub fn python_available() -> bool {
    which::which("python3").is_ok()
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=Pinrun Tests", "-c", "user.email=tests@pinrun.invalid"])
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A `git` that appends each invocation's arguments to `<dir>/git.log` before running the real one.
pub fn logging_git(dir: &Path) -> (PathBuf, PathBuf) {
    let program = dir.join("git");
    let log = dir.join("git.log");
    let script = format!("#!/bin/sh\necho \"$@\" >> '{}'\nexec git \"$@\"\n", log.display());
    std::fs::write(&program, script).unwrap();
    std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
    (program, log)
}

/// Arguments of every logged `git clone`.
pub fn logged_clones(log: &Path) -> Vec<Vec<String>> {
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .filter(|line| line.starts_with("clone "))
        .map(|line| line.split_whitespace().map(str::to_string).collect())
        .collect()
}

/// A repository on local disk that tests commit to, reachable through a `file://` URL.
pub struct SourceRepo {
    _dir: TempDir,
    path: PathBuf,
}

impl SourceRepo {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("origin")).unwrap();
        let path = dir.path().join("origin").canonicalize().unwrap();
        git(&path, &["init", "-q"]);
        git(&path, &["symbolic-ref", "HEAD", "refs/heads/master"]);
        Self { _dir: dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn url(&self) -> String {
        format!("file://{}", self.path.display())
    }

    /// Writes `files` and commits them on the current branch, returning the new head.
    pub fn commit(&self, files: &[(&str, &str)], message: &str) -> String {
        for (name, content) in files {
            let path = self.path.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        }
        git(&self.path, &["add", "-A"]);
        git(&self.path, &["commit", "-q", "-m", message]);
        self.head()
    }

    pub fn symlink(&self, target: &Path, name: &str) {
        std::os::unix::fs::symlink(target, self.path.join(name)).unwrap();
    }

    pub fn checkout_new_branch(&self, name: &str) {
        git(&self.path, &["checkout", "-q", "-b", name]);
    }

    pub fn checkout(&self, name: &str) {
        git(&self.path, &["checkout", "-q", name]);
    }

    pub fn head(&self) -> String {
        git(&self.path, &["rev-parse", "HEAD"])
    }
}

/// Stands in for a real backend: counts calls and echoes the task's arguments.
pub struct CountingBackend {
    common: CommonBackendConfig,
    pub prepares: AtomicUsize,
    pub executions: AtomicUsize,
    pub delay: Option<Duration>,
    pub fail_with_timeout: bool,
}

impl CountingBackend {
    pub fn new() -> Self {
        Self {
            common: CommonBackendConfig::default(),
            prepares: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
            delay: None,
            fail_with_timeout: false,
        }
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for CountingBackend {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn identity(&self) -> String {
        "counting".to_string()
    }

    fn common(&self) -> &CommonBackendConfig {
        &self.common
    }

    async fn prepare(&self, _snapshot: &Snapshot, requirements: &RequirementsSet) -> Result<ExecutionContext> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutionContext::Interpreter {
            path: PathBuf::from("python3"),
            requirements_hash: requirements.resolved_hash().to_string(),
        })
    }

    async fn execute(&self, _context: &ExecutionContext, snapshot: &Snapshot, task: &Task) -> Result<TaskResult> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_with_timeout {
            return Err(PinrunError::timeout(task.timeout(), task.to_string()));
        }
        Ok(TaskResult {
            output: json!({ "args": task.args(), "commit": snapshot.commit_id }),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}
