//! Tasks in a subprocess of the caller's own interpreter
//!
//! Nothing is provisioned. The repository's requirements are reconciled
//! against a declaration of what the interpreter already has, and extras are
//! either refused, ignored or installed into it.

use super::{identity_of, run_with_interpreter, Backend, ExecutionContext};
use crate::config::{CommonBackendConfig, SubprocessConfig};
use crate::errors::{PinrunError, Result};
use crate::keyed_lock::KeyedLocks;
use crate::process;
use crate::requirements::{reconcile, RequirementsSet};
use crate::runner::RunnerFiles;
use crate::snapshot::Snapshot;
use crate::task::{Task, TaskResult};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;

pub struct SubprocessBackend {
    config: SubprocessConfig,
    files: RunnerFiles,
    locks: KeyedLocks,
    // Reconciled requirement hashes whose extras were installed by this instance.
    installed: Mutex<HashSet<String>>,
}

impl SubprocessBackend {
    pub fn new(config: SubprocessConfig, base_dir: &Path) -> Self {
        let files = RunnerFiles::new(base_dir, config.common.runner_script.clone());
        Self {
            config,
            files,
            locks: KeyedLocks::new(),
            installed: Mutex::new(HashSet::new()),
        }
    }

    async fn base_requirements(&self) -> Result<RequirementsSet> {
        match &self.config.current_environment_requirements {
            Some(path) => RequirementsSet::from_file(path).await,
            None => Ok(RequirementsSet::empty()),
        }
    }

    fn already_installed(&self, key: &str) -> bool {
        self.installed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(key)
    }

    async fn install_extras(&self, requirements: &RequirementsSet) -> Result<()> {
        let key = requirements.resolved_hash().to_string();
        let _guard = self.locks.lock(&key).await;
        if self.already_installed(&key) {
            return Ok(());
        }

        log::info!(
            "Installing extra requirements into {}: {}",
            self.config.common.interpreter,
            requirements.extras().join(", ")
        );

        let mut command = Command::new(&self.config.common.interpreter);
        command
            .args(["-m", "pip", "install"])
            .args(requirements.extras());
        let output = process::run(
            command,
            Some(Duration::from_secs(self.config.common.requirements_timeout)),
        )
        .await?;
        if !output.success() {
            return Err(PinrunError::build(
                "Unable to install the extra requirements",
                output.diagnostics(),
            ));
        }

        self.installed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key);
        Ok(())
    }
}

#[async_trait]
impl Backend for SubprocessBackend {
    fn name(&self) -> &'static str {
        "subprocess"
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
        let base = self.base_requirements().await?;
        let reconciled = reconcile(&base, requirements, self.config.requirements_strategy)?;
        if !reconciled.extras().is_empty() {
            self.install_extras(&reconciled).await?;
        }

        Ok(ExecutionContext::Interpreter {
            path: PathBuf::from(&self.config.common.interpreter),
            requirements_hash: reconciled.resolved_hash().to_string(),
        })
    }

    async fn execute(
        &self,
        context: &ExecutionContext,
        snapshot: &Snapshot,
        task: &Task,
    ) -> Result<TaskResult> {
        let interpreter = match context {
            ExecutionContext::Interpreter { path, .. } => path,
            other => {
                return Err(PinrunError::Configuration(format!(
                    "The subprocess backend cannot run in {:?}",
                    other
                )))
            }
        };
        run_with_interpreter(interpreter, &self.files, snapshot, &self.config.common, task).await
    }
}
