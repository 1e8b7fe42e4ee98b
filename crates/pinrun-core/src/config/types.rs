//! Settings type definitions
//!
//! Settings are plain serde structures so they can be written as YAML, built
//! in code, or mixed (file first, `PINRUN_*` environment variables on top).
//! Every field has a default; an empty document is a valid configuration that
//! runs tasks in a subprocess of the caller's interpreter without caching.

use crate::requirements::RequirementsStrategy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Where working copies, environments, task files and Vagrantfiles live.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Fetch each repository branch only once per runner instance.
    #[serde(default)]
    pub single_pull: bool,
    /// Downgrade a failing cache self-test to a warning and run uncached.
    #[serde(default)]
    pub ignore_cache_errors: bool,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            single_pull: false,
            ignore_cache_errors: false,
            cache: CacheConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CacheConfig {
    /// Nothing is ever stored.
    #[default]
    Null,
    /// Process-local map, lost when the runner is dropped.
    Memory,
    /// One file per fingerprint under `path`.
    File { path: PathBuf },
}

/// Which backend runs the tasks, with that backend's options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Subprocess(SubprocessConfig),
    Environment(EnvironmentConfig),
    Container(ContainerConfig),
    Vm(VmConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Subprocess(SubprocessConfig::default())
    }
}

impl BackendConfig {
    pub fn name(&self) -> &'static str {
        match self {
            BackendConfig::Subprocess(_) => "subprocess",
            BackendConfig::Environment(_) => "environment",
            BackendConfig::Container(_) => "container",
            BackendConfig::Vm(_) => "vm",
        }
    }

    pub fn common(&self) -> &CommonBackendConfig {
        match self {
            BackendConfig::Subprocess(config) => &config.common,
            BackendConfig::Environment(config) => &config.common,
            BackendConfig::Container(config) => &config.common,
            BackendConfig::Vm(config) => &config.container.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut CommonBackendConfig {
        match self {
            BackendConfig::Subprocess(config) => &mut config.common,
            BackendConfig::Environment(config) => &mut config.common,
            BackendConfig::Container(config) => &mut config.common,
            BackendConfig::Vm(config) => &mut config.container.common,
        }
    }

    /// A default-configured backend of the named kind that keeps the common options.
    pub fn of_kind(kind: &str, common: CommonBackendConfig) -> Option<Self> {
        let config = match kind.to_lowercase().as_str() {
            "subprocess" => BackendConfig::Subprocess(SubprocessConfig {
                common,
                ..Default::default()
            }),
            "environment" => BackendConfig::Environment(EnvironmentConfig { common }),
            "container" => BackendConfig::Container(ContainerConfig {
                common,
                ..Default::default()
            }),
            "vm" => BackendConfig::Vm(VmConfig {
                container: ContainerConfig {
                    common,
                    ..Default::default()
                },
                ..Default::default()
            }),
            _ => return None,
        };
        Some(config)
    }
}

/// Options every backend understands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommonBackendConfig {
    /// Dependency declaration relative to the repository root; `null` disables it.
    #[serde(default = "default_requirements_location")]
    pub requirements_location: Option<PathBuf>,
    /// Optional lockfile whose content refines the requirements hash.
    #[serde(default)]
    pub lockfile_location: Option<PathBuf>,
    #[serde(default = "default_requirements_timeout")]
    pub requirements_timeout: u64,
    /// Working directory for the task, relative to the repository root.
    #[serde(default)]
    pub cwd: PathBuf,
    /// Interpreter used on the host to create environments and run tasks.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Replaces the bundled runner script.
    #[serde(default)]
    pub runner_script: Option<PathBuf>,
}

impl Default for CommonBackendConfig {
    fn default() -> Self {
        Self {
            requirements_location: default_requirements_location(),
            lockfile_location: None,
            requirements_timeout: default_requirements_timeout(),
            cwd: PathBuf::new(),
            interpreter: default_interpreter(),
            runner_script: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SubprocessConfig {
    #[serde(flatten)]
    pub common: CommonBackendConfig,
    #[serde(default)]
    pub requirements_strategy: RequirementsStrategy,
    /// Declaration describing what the caller's interpreter already has installed.
    #[serde(default)]
    pub current_environment_requirements: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EnvironmentConfig {
    #[serde(flatten)]
    pub common: CommonBackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerConfig {
    #[serde(flatten)]
    pub common: CommonBackendConfig,
    #[serde(default = "default_base_image")]
    pub base_image: String,
    /// System packages layered onto the base image, in this order.
    #[serde(default)]
    pub system_dependencies: Vec<String>,
    #[serde(default = "default_system_install_command")]
    pub system_install_command: String,
    /// Repository images are pulled from and pushed to, e.g. `docker.io/user/pinrun`.
    #[serde(default)]
    pub registry: Option<String>,
    /// Push freshly built images; defaults to on whenever a registry is set.
    #[serde(default)]
    pub push: Option<bool>,
    /// Try the registry before building.
    #[serde(default = "default_true")]
    pub pull: bool,
    #[serde(default)]
    pub keep_container_running: bool,
    /// Interpreter inside the image.
    #[serde(default = "default_container_interpreter")]
    pub container_interpreter: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            common: CommonBackendConfig::default(),
            base_image: default_base_image(),
            system_dependencies: Vec::new(),
            system_install_command: default_system_install_command(),
            registry: None,
            push: None,
            pull: true,
            keep_container_running: false,
            container_interpreter: default_container_interpreter(),
        }
    }
}

impl ContainerConfig {
    pub fn push_enabled(&self) -> bool {
        self.registry.is_some() && self.push.unwrap_or(true)
    }

    pub fn pull_enabled(&self) -> bool {
        self.registry.is_some() && self.pull
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmConfig {
    #[serde(flatten)]
    pub container: ContainerConfig,
    #[serde(rename = "box", default = "default_box")]
    pub vm_box: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Silence the VM tool's own output.
    #[serde(default)]
    pub quiet: bool,
    /// On stop, destroy the VM instead of halting it.
    #[serde(default)]
    pub destroy_on_stop: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            container: ContainerConfig::default(),
            vm_box: default_box(),
            provider: default_provider(),
            quiet: false,
            destroy_on_stop: false,
        }
    }
}

// Default value functions
fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".pinrun"))
        .unwrap_or_else(|| PathBuf::from(".pinrun"))
}

fn default_requirements_location() -> Option<PathBuf> {
    Some(PathBuf::from("requirements.txt"))
}

fn default_requirements_timeout() -> u64 {
    120
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_base_image() -> String {
    "python:3.11-alpine".to_string()
}

fn default_system_install_command() -> String {
    "apk add --no-cache".to_string()
}

fn default_container_interpreter() -> String {
    "python".to_string()
}

fn default_box() -> String {
    "ubuntu/jammy64".to_string()
}

fn default_provider() -> String {
    "virtualbox".to_string()
}

fn default_true() -> bool {
    true
}
