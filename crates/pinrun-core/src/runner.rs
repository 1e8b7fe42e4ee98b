//! The process-side half of a task execution
//!
//! Every backend runs a task the same way: the task definition is written
//! to a JSON file, a runner script is launched with that file as its only
//! argument, and the runner prints one JSON envelope describing the outcome.
//! Backends only differ in where that process lives.

use crate::errors::{PinrunError, Result};
use crate::process::ProcessOutput;
use crate::task::{Task, TaskResult};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const BUNDLED_RUNNER: &str = include_str!("../assets/runner.py");

/// Scripts and task files under `<base_dir>`.
#[derive(Debug, Clone)]
pub struct RunnerFiles {
    base_dir: PathBuf,
    script_override: Option<PathBuf>,
}

impl RunnerFiles {
    pub fn new(base_dir: &Path, script_override: Option<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            script_override,
        }
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.base_dir.join("scripts")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.base_dir.join("tasks")
    }

    /// Materializes the runner script and returns its path. The file name
    /// carries the content hash, so differing runners never overwrite each other.
    pub async fn runner_script(&self) -> Result<PathBuf> {
        let content = match &self.script_override {
            Some(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                PinrunError::Configuration(format!(
                    "Failed to read runner script {}: {}",
                    path.display(),
                    e
                ))
            })?,
            None => BUNDLED_RUNNER.to_string(),
        };

        let digest = format!("{:x}", Sha256::digest(content.as_bytes()));
        let path = self.scripts_dir().join(format!("runner-{}.py", &digest[..12]));
        if !path.exists() {
            write_atomically(&path, content.as_bytes()).await?;
        }
        Ok(path)
    }

    /// Writes the task definition to `tasks/<task hash>.json`.
    pub async fn write_task(&self, task: &Task) -> Result<PathBuf> {
        let path = self.tasks_dir().join(format!("{}.json", task.hash()));
        if !path.exists() {
            write_atomically(&path, task.definition().as_bytes()).await?;
        }
        Ok(path)
    }
}

/// Writes through a uniquely named sibling and renames it into place.
pub async fn write_atomically(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| PinrunError::Io(format!("{} has no parent directory", path.display())))?;
    tokio::fs::create_dir_all(parent).await?;

    let staging = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
    tokio::fs::write(&staging, content).await?;
    if let Err(e) = tokio::fs::rename(&staging, path).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e.into());
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn find_envelope(stdout: &str) -> Option<Envelope> {
    if let Ok(envelope) = serde_json::from_str::<Envelope>(stdout.trim()) {
        return Some(envelope);
    }
    // Anything printed while importing the task, or a remote banner, precedes the envelope.
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| serde_json::from_str::<Envelope>(line).ok())
}

/// Turns the runner's output into a result or the matching build error.
pub fn parse_output(output: &ProcessOutput) -> Result<TaskResult> {
    // The runner exits 0 after printing any envelope, so a non-zero exit means the process itself failed.
    if !output.success() {
        return Err(PinrunError::build(
            format!("Task process exited with {:?}", output.exit_code),
            output.diagnostics(),
        ));
    }

    let envelope = match find_envelope(&output.stdout) {
        Some(envelope) => envelope,
        None => {
            return Err(PinrunError::build(
                "The task returned output that could not be decoded",
                output.diagnostics(),
            ))
        }
    };

    if envelope.success {
        return Ok(TaskResult {
            output: envelope.result,
            stdout: envelope.stdout,
            stderr: envelope.stderr,
        });
    }

    let message = match envelope.reason.as_deref() {
        Some("corrupted_definition") => "The task definition was corrupted",
        Some("import") => "The entry point of the task could not be imported",
        _ => "The task raised an exception",
    };
    Err(PinrunError::build(
        message,
        envelope.error.unwrap_or_else(|| output.stderr.clone()),
    ))
}
