//! Tasks in containers
//!
//! Two phases. The image phase makes sure an image exists for the
//! requirements (local, pulled from the registry, or built and pushed). The
//! container phase starts a container from it with the snapshot mounted
//! read-only and runs the task through the runner inside it.

use super::{identity_of, Backend, ExecutionContext};
use crate::config::{CommonBackendConfig, ContainerConfig};
use crate::errors::{PinrunError, Result};
use crate::keyed_lock::KeyedLocks;
use crate::process::ProcessOutput;
use crate::requirements::RequirementsSet;
use crate::runner::{self, RunnerFiles};
use crate::snapshot::Snapshot;
use crate::task::{Task, TaskResult};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DATA_DIR: &str = "/srv/data";
pub const SCRIPTS_DIR: &str = "/srv/scripts";
pub const TASKS_DIR: &str = "/srv/tasks";
const DEFAULT_REPOSITORY: &str = "pinrun";

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `host:container[:ro]`
    pub binds: Vec<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
}

impl From<ExecOutput> for ProcessOutput {
    fn from(output: ExecOutput) -> Self {
        ProcessOutput {
            exit_code: output.exit_code.map(|code| code as i32),
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

/// Operations the container backend needs from an engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn image_exists(&self, tag: &str) -> Result<bool>;

    /// `Ok(false)` when the registry does not have the image.
    async fn pull_image(&self, tag: &str) -> Result<bool>;

    /// Builds `tag` from a Dockerfile and extra context files.
    async fn build_image(&self, tag: &str, dockerfile: &str, files: &[(String, Vec<u8>)]) -> Result<()>;

    async fn push_image(&self, tag: &str) -> Result<()>;

    async fn container_running(&self, name: &str) -> Result<bool>;

    /// Creates and starts a container that idles until removed. Returns its id.
    async fn start_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn exec(&self, container: &str, command: &[String], working_dir: &str) -> Result<ExecOutput>;

    /// Stops and removes, ignoring containers that are already gone.
    async fn remove_container(&self, container: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    /// Found in the local engine.
    Local,
    Pulled,
    Built,
    /// Built here and pushed to the registry.
    Pushed,
}

pub struct ContainerBackend {
    config: ContainerConfig,
    files: RunnerFiles,
    engine: Arc<dyn ContainerEngine>,
    locks: KeyedLocks,
    images: Mutex<HashMap<String, ImageState>>,
    kept: Mutex<HashSet<String>>,
}

impl ContainerBackend {
    pub fn new(config: ContainerConfig, base_dir: &Path, engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            files: RunnerFiles::new(base_dir, config.common.runner_script.clone()),
            config,
            engine,
            locks: KeyedLocks::new(),
            images: Mutex::new(HashMap::new()),
            kept: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn files(&self) -> &RunnerFiles {
        &self.files
    }

    /// `<registry or pinrun>:<hash of base image, system dependencies and requirements>`
    pub fn image_tag(&self, requirements: &RequirementsSet) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.config.base_image.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.config.system_dependencies.join("\n").as_bytes());
        hasher.update(b"\n");
        hasher.update(requirements.resolved_hash().as_bytes());

        let repository = self
            .config
            .registry
            .as_deref()
            .unwrap_or(DEFAULT_REPOSITORY);
        format!("{}:{:x}", repository, hasher.finalize())
    }

    pub fn image_state(&self, tag: &str) -> Option<ImageState> {
        self.lock_images().get(tag).copied()
    }

    fn set_image_state(&self, tag: &str, state: ImageState) {
        self.lock_images().insert(tag.to_string(), state);
    }

    fn lock_images(&self) -> std::sync::MutexGuard<'_, HashMap<String, ImageState>> {
        self.images.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_kept(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.kept.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn dockerfile(&self, requirements: &RequirementsSet) -> String {
        let mut lines = vec![format!("FROM {}", self.config.base_image)];
        if !self.config.system_dependencies.is_empty() {
            lines.push(format!(
                "RUN {} {}",
                self.config.system_install_command,
                self.config.system_dependencies.join(" ")
            ));
        }
        if !requirements.is_empty() {
            lines.push("COPY requirements.txt /srv/requirements.txt".to_string());
            lines.push(format!(
                "RUN {} -m pip install --no-cache-dir -r /srv/requirements.txt",
                self.config.container_interpreter
            ));
        }
        lines.push(format!("RUN mkdir -p {} {} {}", DATA_DIR, SCRIPTS_DIR, TASKS_DIR));
        lines.push(format!("WORKDIR {}", DATA_DIR));
        lines.join("\n") + "\n"
    }

    /// Image phase: an image for `requirements` exists locally when this returns.
    pub async fn ensure_image(&self, requirements: &RequirementsSet) -> Result<String> {
        let tag = self.image_tag(requirements);
        let _guard = self.locks.lock(&tag).await;

        if self.image_state(&tag).is_some() {
            return Ok(tag);
        }

        if self.engine.image_exists(&tag).await? {
            log::info!("Image {} is available locally", tag);
            self.set_image_state(&tag, ImageState::Local);
            return Ok(tag);
        }

        if self.config.pull_enabled() {
            log::info!("Trying to pull {}", tag);
            if self.engine.pull_image(&tag).await? {
                log::info!("Pulled {}", tag);
                self.set_image_state(&tag, ImageState::Pulled);
                return Ok(tag);
            }
        }

        log::info!("Building image {}", tag);
        let mut files = Vec::new();
        if !requirements.is_empty() {
            files.push((
                "requirements.txt".to_string(),
                requirements.declaration().as_bytes().to_vec(),
            ));
        }
        let limit = self.config.common.requirements_timeout;
        tokio::time::timeout(
            Duration::from_secs(limit),
            self.engine.build_image(&tag, &self.dockerfile(requirements), &files),
        )
        .await
        .map_err(|_| PinrunError::timeout(limit, format!("building image {}", tag)))??;
        self.set_image_state(&tag, ImageState::Built);

        if self.config.push_enabled() {
            self.push(&tag).await?;
        }

        Ok(tag)
    }

    /// Makes sure the registry has `tag`, pushing it unless it came from there.
    pub async fn ensure_published(&self, tag: &str) -> Result<()> {
        let _guard = self.locks.lock(tag).await;
        match self.image_state(tag) {
            Some(ImageState::Pulled) | Some(ImageState::Pushed) => Ok(()),
            _ => self.push(tag).await,
        }
    }

    async fn push(&self, tag: &str) -> Result<()> {
        log::info!("Pushing {}", tag);
        self.engine.push_image(tag).await?;
        self.set_image_state(tag, ImageState::Pushed);
        Ok(())
    }

    /// `pinrun_<repo_id>_<branch>_<short commit>`, the identity of a kept container.
    pub fn container_name(snapshot: &Snapshot) -> String {
        format!(
            "pinrun_{}_{}_{}",
            snapshot.repo_id,
            snapshot.repo_ref.branch.replace('/', "_"),
            snapshot.short_commit()
        )
    }

    pub fn container_labels(snapshot: &Snapshot) -> HashMap<String, String> {
        HashMap::from([
            ("pinrun.repository".to_string(), snapshot.repo_ref.url.clone()),
            ("pinrun.branch".to_string(), snapshot.repo_ref.branch.clone()),
            ("pinrun.commit".to_string(), snapshot.commit_id.clone()),
        ])
    }

    /// The runner invocation inside a container, plus its working directory.
    pub(crate) async fn runner_command(&self, task: &Task) -> Result<(Vec<String>, String)> {
        let script = self.files.runner_script().await?;
        let task_file = self.files.write_task(task).await?;
        let command = vec![
            self.config.container_interpreter.clone(),
            in_container(SCRIPTS_DIR, &script)?,
            in_container(TASKS_DIR, &task_file)?,
        ];

        let cwd = self.config.common.cwd.to_string_lossy();
        let working_dir = if cwd.is_empty() {
            DATA_DIR.to_string()
        } else {
            format!("{}/{}", DATA_DIR, cwd.trim_start_matches("./"))
        };
        Ok((command, working_dir))
    }

    async fn start(&self, tag: &str, snapshot: &Snapshot) -> Result<String> {
        let keep = self.config.keep_container_running;
        let name = if keep {
            Self::container_name(snapshot)
        } else {
            format!(
                "{}_{}",
                Self::container_name(snapshot),
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            )
        };

        // Starting replaces any container of the same name, so check-and-start is one step per name.
        let _guard = if keep {
            Some(self.locks.lock(&name).await)
        } else {
            None
        };
        if keep && self.engine.container_running(&name).await? {
            log::info!("Reusing running container {}", name);
            self.lock_kept().insert(name.clone());
            return Ok(name);
        }

        let spec = ContainerSpec {
            name: name.clone(),
            image: tag.to_string(),
            binds: vec![
                format!("{}:{}:ro", snapshot.local_path.display(), DATA_DIR),
                format!("{}:{}:ro", self.files.scripts_dir().display(), SCRIPTS_DIR),
                format!("{}:{}:ro", self.files.tasks_dir().display(), TASKS_DIR),
            ],
            labels: Self::container_labels(snapshot),
        };
        self.engine.start_container(&spec).await?;
        log::info!("Started container {} from {}", name, tag);

        if keep {
            self.lock_kept().insert(name.clone());
        }
        Ok(name)
    }

    async fn discard(&self, name: &str) {
        self.lock_kept().remove(name);
        if let Err(e) = self.engine.remove_container(name).await {
            log::warn!("Failed to remove container {}: {}", name, e);
        }
    }

    /// Removes every container kept alive by this backend.
    pub async fn stop_containers(&self) -> Result<()> {
        let names: Vec<String> = self.lock_kept().drain().collect();
        for name in names {
            log::info!("Stopping kept container {}", name);
            self.engine.remove_container(&name).await?;
        }
        Ok(())
    }

    pub fn kept_containers(&self) -> Vec<String> {
        self.lock_kept().iter().cloned().collect()
    }
}

/// Path of a file from a mounted host directory as seen inside the container.
fn in_container(mount: &str, host_path: &Path) -> Result<String> {
    let file_name = host_path
        .file_name()
        .ok_or_else(|| PinrunError::Io(format!("{} has no file name", host_path.display())))?;
    Ok(format!("{}/{}", mount, file_name.to_string_lossy()))
}

#[async_trait]
impl Backend for ContainerBackend {
    fn name(&self) -> &'static str {
        "container"
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
        let tag = self.ensure_image(requirements).await?;
        Ok(ExecutionContext::Image {
            tag,
            requirements_hash: requirements.resolved_hash().to_string(),
        })
    }

    async fn execute(
        &self,
        context: &ExecutionContext,
        snapshot: &Snapshot,
        task: &Task,
    ) -> Result<TaskResult> {
        let tag = match context {
            ExecutionContext::Image { tag, .. } => tag,
            other => {
                return Err(PinrunError::Configuration(format!(
                    "The container backend cannot run in {:?}",
                    other
                )))
            }
        };
        super::task_cwd(snapshot, &self.config.common)?;
        let (command, working_dir) = self.runner_command(task).await?;
        let name = self.start(tag, snapshot).await?;

        log::info!("Running {} in container {}", task, name);
        let outcome = tokio::time::timeout(
            Duration::from_secs(task.timeout()),
            self.engine.exec(&name, &command, &working_dir),
        )
        .await;

        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                if !self.config.keep_container_running {
                    self.discard(&name).await;
                }
                return Err(e);
            }
            Err(_) => {
                // Whatever the task left behind is unknown, so the container goes even when kept.
                log::warn!("{} timed out after {}s in {}", task, task.timeout(), name);
                self.discard(&name).await;
                return Err(PinrunError::timeout(task.timeout(), task.to_string()));
            }
        };

        if !self.config.keep_container_running {
            self.discard(&name).await;
        }
        runner::parse_output(&output.into())
    }

    async fn teardown(&self) -> Result<()> {
        self.stop_containers().await
    }
}
