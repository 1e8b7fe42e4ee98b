//! Tasks in isolated interpreter environments
//!
//! Environments live under `<base_dir>/environments/<requirements hash>` and
//! are shared by every repository whose declaration hashes the same. An
//! environment is usable only once its ready marker exists; anything else
//! found at that path is a leftover of a failed build and gets rebuilt.

use super::{identity_of, run_with_interpreter, Backend, ExecutionContext};
use crate::config::{CommonBackendConfig, EnvironmentConfig};
use crate::errors::{PinrunError, Result};
use crate::keyed_lock::KeyedLocks;
use crate::process;
use crate::requirements::RequirementsSet;
use crate::runner::RunnerFiles;
use crate::snapshot::Snapshot;
use crate::task::{Task, TaskResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;

pub const READY_MARKER: &str = ".pinrun-ready";

/// Creates environments and installs requirements into them.
#[async_trait]
pub trait EnvironmentInstaller: Send + Sync {
    /// Build an environment at `path`, installing `requirements_file` when given.
    async fn create(
        &self,
        path: &Path,
        requirements_file: Option<&Path>,
        timeout: Duration,
    ) -> Result<()>;

    /// Interpreter inside an environment created at `path`.
    fn interpreter_in(&self, path: &Path) -> PathBuf;
}

/// `python -m venv` followed by `pip install -r`.
#[derive(Debug, Clone)]
pub struct VenvInstaller {
    interpreter: String,
}

impl VenvInstaller {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

#[async_trait]
impl EnvironmentInstaller for VenvInstaller {
    async fn create(
        &self,
        path: &Path,
        requirements_file: Option<&Path>,
        timeout: Duration,
    ) -> Result<()> {
        // One budget for the whole install, not one per step.
        let deadline = Instant::now() + timeout;

        let mut command = Command::new(&self.interpreter);
        command.args(["-m", "venv"]).arg(path);
        let output = process::run(command, Some(timeout)).await?;
        if !output.success() {
            return Err(PinrunError::build(
                format!("Unable to create an environment at {}", path.display()),
                output.diagnostics(),
            ));
        }

        if let Some(requirements_file) = requirements_file {
            let mut command = Command::new(self.interpreter_in(path));
            command
                .args(["-m", "pip", "install", "-r"])
                .arg(requirements_file);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PinrunError::timeout(
                    timeout.as_secs(),
                    format!("installing requirements into {}", path.display()),
                ));
            }
            let output = process::run(command, Some(remaining)).await?;
            if !output.success() {
                return Err(PinrunError::build(
                    "Unable to install requirements from the target repository",
                    output.diagnostics(),
                ));
            }
        }

        Ok(())
    }

    fn interpreter_in(&self, path: &Path) -> PathBuf {
        path.join("bin").join("python")
    }
}

pub struct EnvironmentBackend {
    config: EnvironmentConfig,
    files: RunnerFiles,
    environments_dir: PathBuf,
    installer: Arc<dyn EnvironmentInstaller>,
    locks: KeyedLocks,
}

impl EnvironmentBackend {
    pub fn new(config: EnvironmentConfig, base_dir: &Path) -> Self {
        let installer = Arc::new(VenvInstaller::new(config.common.interpreter.clone()));
        Self::with_installer(config, base_dir, installer)
    }

    pub fn with_installer(
        config: EnvironmentConfig,
        base_dir: &Path,
        installer: Arc<dyn EnvironmentInstaller>,
    ) -> Self {
        Self {
            files: RunnerFiles::new(base_dir, config.common.runner_script.clone()),
            environments_dir: base_dir.join("environments"),
            config,
            installer,
            locks: KeyedLocks::new(),
        }
    }

    pub fn environment_path(&self, requirements: &RequirementsSet) -> PathBuf {
        self.environments_dir.join(requirements.resolved_hash())
    }

    async fn build(&self, path: &Path, requirements: &RequirementsSet) -> Result<()> {
        if path.exists() {
            log::warn!("Removing unfinished environment at {}", path.display());
            tokio::fs::remove_dir_all(path).await?;
        }
        tokio::fs::create_dir_all(&self.environments_dir).await?;

        let requirements_file = if requirements.is_empty() {
            None
        } else {
            let file = self
                .environments_dir
                .join(format!("{}.requirements.txt", requirements.resolved_hash()));
            tokio::fs::write(&file, requirements.declaration()).await?;
            Some(file)
        };

        log::info!("Creating environment at {}", path.display());
        let created = self
            .installer
            .create(
                path,
                requirements_file.as_deref(),
                Duration::from_secs(self.config.common.requirements_timeout),
            )
            .await;

        if let Err(e) = created {
            if path.exists() {
                tokio::fs::remove_dir_all(path).await?;
            }
            return Err(e);
        }

        tokio::fs::write(path.join(READY_MARKER), requirements.resolved_hash()).await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for EnvironmentBackend {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn identity(&self) -> String {
        identity_of(self.name(), &self.config)
    }

    fn common(&self) -> &CommonBackendConfig {
        &self.config.common
    }

    async fn prepare(
        &self,
        _snapshot: &Snapshot,
        requirements: &RequirementsSet,
    ) -> Result<ExecutionContext> {
        let path = self.environment_path(requirements);
        let _guard = self.locks.lock(requirements.resolved_hash()).await;

        if path.join(READY_MARKER).exists() {
            log::info!("Reusing environment at {}", path.display());
        } else {
            self.build(&path, requirements).await?;
        }

        Ok(ExecutionContext::Interpreter {
            path: self.installer.interpreter_in(&path),
            requirements_hash: requirements.resolved_hash().to_string(),
        })
    }

    async fn execute(
        &self,
        context: &ExecutionContext,
        snapshot: &Snapshot,
        task: &Task,
    ) -> Result<TaskResult> {
        match context {
            ExecutionContext::Interpreter { path, .. } => {
                run_with_interpreter(path, &self.files, snapshot, &self.config.common, task).await
            }
            other => Err(PinrunError::Configuration(format!(
                "The environment backend cannot run in {:?}",
                other
            ))),
        }
    }
}
