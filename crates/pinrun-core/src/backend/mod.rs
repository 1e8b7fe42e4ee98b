//! Execution backends
//!
//! A backend provisions an [`ExecutionContext`] for a snapshot and its
//! requirements, then runs tasks inside it under the task's timeout. There is
//! one implementation per isolation level, chosen from settings by
//! [`from_config`]:
//!
//! - [`SubprocessBackend`]: the caller's own interpreter
//! - [`EnvironmentBackend`]: an isolated environment per requirements hash
//! - [`ContainerBackend`]: an image per requirements hash, a container per task
//! - [`VmBackend`]: the container backend nested in a per-repository VM

use crate::config::{BackendConfig, CommonBackendConfig, Settings};
use crate::errors::{PinrunError, Result};
use crate::process;
use crate::requirements::RequirementsSet;
use crate::runner::{self, RunnerFiles};
use crate::snapshot::Snapshot;
use crate::task::{Task, TaskResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

pub mod container;
pub mod docker;
pub mod environment;
pub mod subprocess;
pub mod vagrant;
pub mod vm;

pub use container::{ContainerBackend, ContainerEngine, ContainerSpec, ExecOutput};
pub use docker::DockerEngine;
pub use environment::{EnvironmentBackend, EnvironmentInstaller, VenvInstaller};
pub use subprocess::SubprocessBackend;
pub use vagrant::{RemoteChannel, VagrantMachine};
pub use vm::VmBackend;

/// Handle to where a task runs, bound to one requirements set.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionContext {
    /// A host interpreter: the caller's own or an isolated environment's.
    Interpreter {
        path: PathBuf,
        requirements_hash: String,
    },
    /// A ready image, run locally or inside a VM.
    Image {
        tag: String,
        requirements_hash: String,
    },
}

impl ExecutionContext {
    pub fn requirements_hash(&self) -> &str {
        match self {
            ExecutionContext::Interpreter {
                requirements_hash, ..
            }
            | ExecutionContext::Image {
                requirements_hash, ..
            } => requirements_hash,
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stable description of this backend and its configuration, part of every fingerprint.
    fn identity(&self) -> String;

    fn common(&self) -> &CommonBackendConfig;

    /// Provisions (or reuses) what `requirements` need to run tasks from `snapshot`.
    async fn prepare(
        &self,
        snapshot: &Snapshot,
        requirements: &RequirementsSet,
    ) -> Result<ExecutionContext>;

    /// Runs `task` once. No partial result is ever returned.
    async fn execute(
        &self,
        context: &ExecutionContext,
        snapshot: &Snapshot,
        task: &Task,
    ) -> Result<TaskResult>;

    /// Releases long-lived resources such as kept containers and VMs.
    async fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

/// Builds the backend named in `settings`. `base_dir` must be absolute.
pub fn from_config(settings: &Settings, base_dir: &Path) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match &settings.backend {
        BackendConfig::Subprocess(config) => {
            Arc::new(SubprocessBackend::new(config.clone(), base_dir))
        }
        BackendConfig::Environment(config) => {
            Arc::new(EnvironmentBackend::new(config.clone(), base_dir))
        }
        BackendConfig::Container(config) => Arc::new(ContainerBackend::new(
            config.clone(),
            base_dir,
            Arc::new(DockerEngine::connect()?),
        )),
        BackendConfig::Vm(config) => Arc::new(VmBackend::new(config.clone(), base_dir)?),
    };
    log::debug!("Using the {} backend", backend.name());
    Ok(backend)
}

/// Identity string for a backend: its name and serialized options.
pub(crate) fn identity_of<T: serde::Serialize>(name: &str, config: &T) -> String {
    match serde_json::to_string(config) {
        Ok(serialized) => format!("{}:{}", name, serialized),
        Err(_) => name.to_string(),
    }
}

/// Directory the task runs in, inside the snapshot.
pub(crate) fn task_cwd(snapshot: &Snapshot, common: &CommonBackendConfig) -> Result<PathBuf> {
    let cwd = snapshot.local_path.join(&common.cwd);
    if !cwd.is_dir() {
        return Err(PinrunError::Configuration(format!(
            "Working directory {} does not exist in the repository",
            common.cwd.display()
        )));
    }
    Ok(cwd)
}

/// Runs `task` through the runner with a host interpreter.
pub(crate) async fn run_with_interpreter(
    interpreter: &Path,
    files: &RunnerFiles,
    snapshot: &Snapshot,
    common: &CommonBackendConfig,
    task: &Task,
) -> Result<TaskResult> {
    let cwd = task_cwd(snapshot, common)?;
    let script = files.runner_script().await?;
    let task_file = files.write_task(task).await?;

    log::info!("Running {} at {}", task, cwd.display());

    let mut command = Command::new(interpreter);
    command.arg(&script).arg(&task_file).current_dir(&cwd);

    let output = process::run(command, Some(Duration::from_secs(task.timeout())))
        .await
        .map_err(|e| {
            if e.is_timeout() {
                PinrunError::timeout(task.timeout(), task.to_string())
            } else {
                e
            }
        })?;
    runner::parse_output(&output)
}
