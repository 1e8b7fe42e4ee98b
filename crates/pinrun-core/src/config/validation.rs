//! Settings validation
//!
//! Catches contradictory settings before any repository is touched.

use crate::config::types::*;
use crate::errors::{PinrunError, Result};
use std::path::{Component, Path};

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(PinrunError::Configuration(
                "base_dir cannot be empty".to_string(),
            ));
        }

        if let CacheConfig::File { path } = &self.cache {
            if path.as_os_str().is_empty() {
                return Err(PinrunError::Configuration(
                    "File cache requires a path".to_string(),
                ));
            }
        }

        self.backend.validate()
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<()> {
        self.common().validate()?;

        match self {
            BackendConfig::Subprocess(config) => {
                if let Some(path) = &config.current_environment_requirements {
                    if !path.is_file() {
                        return Err(PinrunError::Configuration(format!(
                            "current_environment_requirements {} does not exist",
                            path.display()
                        )));
                    }
                }
            }
            BackendConfig::Environment(_) => {}
            BackendConfig::Container(config) => config.validate()?,
            BackendConfig::Vm(config) => {
                config.container.validate()?;
                if config.container.registry.is_none() {
                    return Err(PinrunError::Configuration(
                        "The vm backend requires a registry to move images into the VM".to_string(),
                    ));
                }
                if config.container.push == Some(false) {
                    return Err(PinrunError::Configuration(
                        "The vm backend cannot run with push disabled".to_string(),
                    ));
                }
                if config.vm_box.trim().is_empty() {
                    return Err(PinrunError::Configuration("VM box cannot be empty".to_string()));
                }
            }
        }

        Ok(())
    }
}

impl CommonBackendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.requirements_timeout == 0 {
            return Err(PinrunError::Configuration(
                "requirements_timeout must be at least one second".to_string(),
            ));
        }
        if self.interpreter.trim().is_empty() {
            return Err(PinrunError::Configuration(
                "interpreter cannot be empty".to_string(),
            ));
        }

        check_relative("cwd", &self.cwd)?;
        if let Some(location) = &self.requirements_location {
            check_relative("requirements_location", location)?;
        }
        if let Some(lockfile) = &self.lockfile_location {
            check_relative("lockfile_location", lockfile)?;
        }

        Ok(())
    }
}

impl ContainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_image.trim().is_empty() {
            return Err(PinrunError::Configuration(
                "base_image cannot be empty".to_string(),
            ));
        }
        if self.push == Some(true) && self.registry.is_none() {
            return Err(PinrunError::Configuration(
                "push is enabled but no registry is configured".to_string(),
            ));
        }
        if !self.system_dependencies.is_empty() && self.system_install_command.trim().is_empty() {
            return Err(PinrunError::Configuration(
                "system_dependencies need a system_install_command".to_string(),
            ));
        }
        Ok(())
    }
}

/// Paths inside the repository must stay inside it.
fn check_relative(field: &str, path: &Path) -> Result<()> {
    let contained = path
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    if !contained {
        return Err(PinrunError::Configuration(format!(
            "{} must be a relative path inside the repository, got {}",
            field,
            path.display()
        )));
    }
    Ok(())
}
