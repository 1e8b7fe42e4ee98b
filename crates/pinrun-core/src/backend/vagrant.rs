//! Virtual machines driven through the `vagrant` command line

use crate::config::VmConfig;
use crate::errors::{PinrunError, Result};
use crate::process::{self, ProcessOutput};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Where the VM sees the repository's working copies.
pub const REMOTE_REPOS_DIR: &str = "/srv/repos";
/// Where the VM sees its own directory on the host.
pub const REMOTE_SHARED_DIR: &str = "/vagrant";

/// Lifecycle of one machine plus a way to run commands inside it.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    async fn is_running(&self) -> Result<bool>;

    async fn up(&self) -> Result<()>;

    async fn halt(&self) -> Result<()>;

    async fn destroy(&self) -> Result<()>;

    /// Runs a shell command inside the machine.
    async fn run(&self, command: &str, timeout: Option<Duration>) -> Result<ProcessOutput>;

    /// Host directory visible inside the machine at [`REMOTE_SHARED_DIR`].
    fn shared_dir(&self) -> &Path;
}

#[derive(Debug, Clone)]
pub struct VagrantMachine {
    dir: PathBuf,
    program: PathBuf,
    quiet: bool,
}

impl VagrantMachine {
    pub fn new(dir: PathBuf, quiet: bool) -> Self {
        Self::with_program(dir, "vagrant", quiet)
    }

    pub fn with_program(dir: PathBuf, program: impl Into<PathBuf>, quiet: bool) -> Self {
        Self {
            dir,
            program: program.into(),
            quiet,
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.program);
        command.args(args).current_dir(&self.dir);
        command
    }

    async fn lifecycle(&self, args: &[&str], action: &str) -> Result<()> {
        let output = process::run(self.command(args), None).await?;
        if !self.quiet {
            log::debug!("vagrant {}:\n{}", args.join(" "), output.stdout);
        }
        if !output.success() {
            return Err(PinrunError::build(
                format!("Failed to {} the VM in {}", action, self.dir.display()),
                output.diagnostics(),
            ));
        }
        Ok(())
    }
}

/// Writes the machine definition for one repository. `repo_dir` is synced to `/srv/repos/<repo_id>`.
pub async fn write_vagrantfile(dir: &Path, config: &VmConfig, repo_id: &str, repo_dir: &Path) -> Result<()> {
    let content = format!(
        r#"Vagrant.configure("2") do |config|
  config.vm.box = "{vm_box}"
  config.vm.provider "{provider}"
  config.vm.synced_folder "{repo_dir}", "{remote}/{repo_id}"
  config.vm.provision "docker"
end
"#,
        vm_box = config.vm_box,
        provider = config.provider,
        repo_dir = repo_dir.display(),
        remote = REMOTE_REPOS_DIR,
        repo_id = repo_id,
    );

    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join("Vagrantfile");
    let current = tokio::fs::read_to_string(&path).await.ok();
    if current.as_deref() != Some(content.as_str()) {
        tokio::fs::write(&path, content).await?;
    }
    Ok(())
}

#[async_trait]
impl RemoteChannel for VagrantMachine {
    async fn is_running(&self) -> Result<bool> {
        let output = process::run(self.command(&["status", "--machine-readable"]), None).await?;
        if !output.success() {
            return Ok(false);
        }
        // 1700000000,default,state,running
        Ok(output.stdout.lines().any(|line| {
            let fields: Vec<&str> = line.split(',').collect();
            fields.len() >= 4 && fields[2] == "state" && fields[3] == "running"
        }))
    }

    async fn up(&self) -> Result<()> {
        log::info!("Starting VM in {}", self.dir.display());
        self.lifecycle(&["up", "--provision"], "start").await
    }

    async fn halt(&self) -> Result<()> {
        log::info!("Halting VM in {}", self.dir.display());
        self.lifecycle(&["halt"], "halt").await
    }

    async fn destroy(&self) -> Result<()> {
        log::info!("Destroying VM in {}", self.dir.display());
        self.lifecycle(&["destroy", "-f"], "destroy").await
    }

    async fn run(&self, command: &str, timeout: Option<Duration>) -> Result<ProcessOutput> {
        process::run(self.command(&["ssh", "-c", command]), timeout).await
    }

    fn shared_dir(&self) -> &Path {
        &self.dir
    }
}
