//! Containers nested in a virtual machine
//!
//! The image phase is the container backend's, with a push to the registry
//! always enforced so the machine can pull the image. Each repository gets
//! one machine, created on first use and kept until [`Backend::teardown`].
//! Inside it, the container phase is replayed with `docker` commands over the
//! remote channel.

use super::container::{ContainerBackend, ContainerEngine, DATA_DIR, SCRIPTS_DIR, TASKS_DIR};
use super::docker::DockerEngine;
use super::vagrant::{self, RemoteChannel, VagrantMachine, REMOTE_REPOS_DIR, REMOTE_SHARED_DIR};
use super::{identity_of, Backend, ExecutionContext};
use crate::config::{CommonBackendConfig, VmConfig};
use crate::errors::{PinrunError, Result};
use crate::keyed_lock::KeyedLocks;
use crate::requirements::RequirementsSet;
use crate::runner;
use crate::snapshot::Snapshot;
use crate::task::{Task, TaskResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type ChannelFactory = Box<dyn Fn(PathBuf, &VmConfig) -> Arc<dyn RemoteChannel> + Send + Sync>;

struct Machine {
    channel: Arc<dyn RemoteChannel>,
    images: HashSet<String>,
    kept: HashSet<String>,
}

pub struct VmBackend {
    config: VmConfig,
    container: ContainerBackend,
    vagrant_dir: PathBuf,
    repos_dir: PathBuf,
    factory: ChannelFactory,
    locks: KeyedLocks,
    machines: Mutex<HashMap<String, Machine>>,
}

impl VmBackend {
    pub fn new(config: VmConfig, base_dir: &Path) -> Result<Self> {
        let engine = Arc::new(DockerEngine::connect()?);
        let factory: ChannelFactory = Box::new(|dir: PathBuf, config: &VmConfig| {
            Arc::new(VagrantMachine::new(dir, config.quiet)) as Arc<dyn RemoteChannel>
        });
        Self::with_parts(config, base_dir, engine, factory)
    }

    pub fn with_parts(
        config: VmConfig,
        base_dir: &Path,
        engine: Arc<dyn ContainerEngine>,
        factory: ChannelFactory,
    ) -> Result<Self> {
        if config.container.registry.is_none() {
            return Err(PinrunError::Configuration(
                "The vm backend requires a registry to move images into the VM".to_string(),
            ));
        }
        Ok(Self {
            container: ContainerBackend::new(config.container.clone(), base_dir, engine),
            vagrant_dir: base_dir.join("vagrant"),
            repos_dir: base_dir.join("repos"),
            config,
            factory,
            locks: KeyedLocks::new(),
            machines: Mutex::new(HashMap::new()),
        })
    }

    fn lock_machines(&self) -> std::sync::MutexGuard<'_, HashMap<String, Machine>> {
        self.machines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn channel(&self, repo_id: &str) -> Option<Arc<dyn RemoteChannel>> {
        self.lock_machines()
            .get(repo_id)
            .map(|machine| machine.channel.clone())
    }

    pub fn machine_dir(&self, repo_id: &str) -> PathBuf {
        self.vagrant_dir.join(repo_id)
    }

    /// The machine for `repo_id`, brought up if this backend has not seen it yet.
    async fn ensure_machine(&self, repo_id: &str) -> Result<Arc<dyn RemoteChannel>> {
        let _guard = self.locks.lock(repo_id).await;
        if let Some(channel) = self.channel(repo_id) {
            return Ok(channel);
        }

        let dir = self.machine_dir(repo_id);
        vagrant::write_vagrantfile(&dir, &self.config, repo_id, &self.repos_dir.join(repo_id)).await?;
        let channel = (self.factory)(dir, &self.config);
        if channel.is_running().await? {
            log::info!("VM for {} is already running", repo_id);
        } else {
            channel.up().await?;
        }

        self.lock_machines().insert(
            repo_id.to_string(),
            Machine {
                channel: channel.clone(),
                images: HashSet::new(),
                kept: HashSet::new(),
            },
        );
        Ok(channel)
    }

    async fn pull_inside(&self, repo_id: &str, channel: &dyn RemoteChannel, tag: &str) -> Result<()> {
        let _guard = self.locks.lock(&format!("pull:{}/{}", repo_id, tag)).await;
        let pulled = self
            .lock_machines()
            .get(repo_id)
            .map(|machine| machine.images.contains(tag))
            .unwrap_or(false);
        if pulled {
            return Ok(());
        }

        log::info!("Pulling {} inside the VM for {}", tag, repo_id);
        let timeout = Duration::from_secs(self.config.container.common.requirements_timeout);
        let output = channel
            .run(&format!("docker pull {}", shell_quote(tag)), Some(timeout))
            .await?;
        if !output.success() {
            return Err(PinrunError::build(
                format!("Failed to pull {} inside the VM", tag),
                output.diagnostics(),
            ));
        }

        if let Some(machine) = self.lock_machines().get_mut(repo_id) {
            machine.images.insert(tag.to_string());
        }
        Ok(())
    }

    /// Copies a host file into the machine's shared directory, returning its path inside the VM.
    async fn share(&self, channel: &dyn RemoteChannel, file: &Path, subdir: &str) -> Result<String> {
        let name = file
            .file_name()
            .ok_or_else(|| PinrunError::Io(format!("{} has no file name", file.display())))?
            .to_string_lossy()
            .to_string();
        let content = tokio::fs::read(file).await?;
        runner::write_atomically(&channel.shared_dir().join(subdir).join(&name), &content).await?;
        Ok(format!("{}/{}/{}", REMOTE_SHARED_DIR, subdir, name))
    }

    async fn remove_remote(&self, channel: &dyn RemoteChannel, name: &str) {
        let command = format!("docker rm -f {}", shell_quote(name));
        match channel.run(&command, None).await {
            Ok(output) if output.success() => {}
            Ok(output) => log::warn!("Failed to remove {} in VM: {}", name, output.stderr.trim()),
            Err(e) => log::warn!("Failed to remove {} in VM: {}", name, e),
        }
    }

    async fn start_remote(
        &self,
        channel: &dyn RemoteChannel,
        snapshot: &Snapshot,
        tag: &str,
        name: &str,
    ) -> Result<()> {
        let keep = self.config.container.keep_container_running;
        // `docker run` below replaces a same-named container.
        let _guard = if keep {
            Some(self.locks.lock(&format!("container:{}", name)).await)
        } else {
            None
        };
        if keep {
            let inspect = format!(
                "docker inspect -f '{{{{.State.Running}}}}' {}",
                shell_quote(name)
            );
            let output = channel.run(&inspect, None).await?;
            if output.success() && output.stdout.trim() == "true" {
                log::info!("Reusing running container {} in VM", name);
                return Ok(());
            }
        }

        let data = format!(
            "{}/{}/{}",
            REMOTE_REPOS_DIR, snapshot.repo_id, snapshot.repo_ref.branch
        );
        let command = format!(
            "docker rm -f {name} >/dev/null 2>&1; docker run -d -t --name {name} {labels} -v {data}:{data_dir}:ro -v {scripts}:{scripts_dir}:ro -v {tasks}:{tasks_dir}:ro {tag} sh",
            name = shell_quote(name),
            labels = ContainerBackend::container_labels(snapshot)
                .iter()
                .map(|(key, value)| format!("--label {}", shell_quote(&format!("{}={}", key, value))))
                .collect::<Vec<_>>()
                .join(" "),
            data = shell_quote(&data),
            data_dir = DATA_DIR,
            scripts = shell_quote(&format!("{}/scripts", REMOTE_SHARED_DIR)),
            scripts_dir = SCRIPTS_DIR,
            tasks = shell_quote(&format!("{}/tasks", REMOTE_SHARED_DIR)),
            tasks_dir = TASKS_DIR,
            tag = shell_quote(tag),
        );
        let output = channel.run(&command, None).await?;
        if !output.success() {
            return Err(PinrunError::build(
                format!("Failed to start container {} in the VM", name),
                output.diagnostics(),
            ));
        }
        log::info!("Started container {} in VM", name);
        Ok(())
    }

    /// Removes kept containers, then halts or destroys every machine.
    pub async fn stop_machines(&self) -> Result<()> {
        let machines: Vec<(String, Machine)> = self.lock_machines().drain().collect();
        for (repo_id, machine) in machines {
            for name in &machine.kept {
                self.remove_remote(machine.channel.as_ref(), name).await;
            }
            if self.config.destroy_on_stop {
                machine.channel.destroy().await?;
            } else {
                machine.channel.halt().await?;
            }
            log::info!("Stopped VM for {}", repo_id);
        }
        Ok(())
    }
}

/// Single-quotes `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
impl Backend for VmBackend {
    fn name(&self) -> &'static str {
        "vm"
    }

    fn identity(&self) -> String {
        identity_of(self.name(), &self.config)
    }

    fn common(&self) -> &CommonBackendConfig {
        &self.config.container.common
    }

    async fn prepare(
        &self,
        snapshot: &Snapshot,
        requirements: &RequirementsSet,
    ) -> Result<ExecutionContext> {
        let tag = self.container.ensure_image(requirements).await?;
        self.container.ensure_published(&tag).await?;

        let channel = self.ensure_machine(&snapshot.repo_id).await?;
        self.pull_inside(&snapshot.repo_id, channel.as_ref(), &tag).await?;

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
                    "The vm backend cannot run in {:?}",
                    other
                )))
            }
        };
        super::task_cwd(snapshot, &self.config.container.common)?;
        let channel = self.ensure_machine(&snapshot.repo_id).await?;

        let files = self.container.files();
        let script = self.share(channel.as_ref(), &files.runner_script().await?, "scripts").await?;
        let task_file = self.share(channel.as_ref(), &files.write_task(task).await?, "tasks").await?;
        let (_, working_dir) = self.container.runner_command(task).await?;

        let keep = self.config.container.keep_container_running;
        let base_name = ContainerBackend::container_name(snapshot);
        let name = if keep {
            base_name
        } else {
            format!("{}_{}", base_name, &uuid::Uuid::new_v4().simple().to_string()[..8])
        };
        self.start_remote(channel.as_ref(), snapshot, tag, &name).await?;
        if keep {
            if let Some(machine) = self.lock_machines().get_mut(&snapshot.repo_id) {
                machine.kept.insert(name.clone());
            }
        }

        let scripts_in_container = script.replacen(&format!("{}/scripts", REMOTE_SHARED_DIR), SCRIPTS_DIR, 1);
        let task_in_container = task_file.replacen(&format!("{}/tasks", REMOTE_SHARED_DIR), TASKS_DIR, 1);
        let command = format!(
            "docker exec -w {} {} {} {} {}",
            shell_quote(&working_dir),
            shell_quote(&name),
            shell_quote(&self.config.container.container_interpreter),
            shell_quote(&scripts_in_container),
            shell_quote(&task_in_container),
        );

        log::info!("Running {} in VM container {}", task, name);
        let outcome = channel
            .run(&command, Some(Duration::from_secs(task.timeout())))
            .await;

        let output = match outcome {
            Ok(output) => output,
            Err(e) => {
                if e.is_timeout() || !keep {
                    if let Some(machine) = self.lock_machines().get_mut(&snapshot.repo_id) {
                        machine.kept.remove(&name);
                    }
                    self.remove_remote(channel.as_ref(), &name).await;
                }
                if e.is_timeout() {
                    log::warn!("{} timed out after {}s in VM", task, task.timeout());
                    return Err(PinrunError::timeout(task.timeout(), task.to_string()));
                }
                return Err(e);
            }
        };

        if !keep {
            self.remove_remote(channel.as_ref(), &name).await;
        }
        runner::parse_output(&output)
    }

    async fn teardown(&self) -> Result<()> {
        self.stop_machines().await
    }
}
