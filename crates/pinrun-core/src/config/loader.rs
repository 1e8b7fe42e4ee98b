//! Settings loader for YAML files and `PINRUN_*` environment overrides

use crate::config::types::*;
use crate::errors::{PinrunError, Result};
use std::env;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const ENV_PREFIX: &str = "PINRUN_";

pub struct SettingsLoader;

impl SettingsLoader {
    /// Load settings from a YAML file, apply environment overrides and validate.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Settings> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| {
            PinrunError::Configuration(format!(
                "Failed to read settings file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_str(&content)
    }

    /// Load settings from a YAML string, apply environment overrides and validate.
    pub fn from_str(content: &str) -> Result<Settings> {
        let mut settings: Settings = if content.trim().is_empty() {
            Settings::default()
        } else {
            serde_yaml::from_str(content)?
        };
        Self::apply_env_overrides(&mut settings, |name| env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults plus environment overrides, for running without a settings file.
    pub fn from_env() -> Result<Settings> {
        Self::from_str("")
    }

    /// Overlay `PINRUN_*` variables on `settings`. `lookup` receives full variable names.
    pub fn apply_env_overrides<F>(settings: &mut Settings, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));

        if let Some(base_dir) = var("BASE_DIR") {
            settings.base_dir = PathBuf::from(base_dir);
        }
        if let Some(value) = var("SINGLE_PULL") {
            settings.single_pull = parse_bool("PINRUN_SINGLE_PULL", &value)?;
        }
        if let Some(value) = var("IGNORE_CACHE_ERRORS") {
            settings.ignore_cache_errors = parse_bool("PINRUN_IGNORE_CACHE_ERRORS", &value)?;
        }
        if let Some(kind) = var("BACKEND") {
            if !kind.eq_ignore_ascii_case(settings.backend.name()) {
                let common = settings.backend.common().clone();
                settings.backend = BackendConfig::of_kind(&kind, common).ok_or_else(|| {
                    PinrunError::Configuration(format!(
                        "Unknown backend '{}' in PINRUN_BACKEND (expected subprocess, environment, container or vm)",
                        kind
                    ))
                })?;
            }
        }
        if let Some(location) = var("REQUIREMENTS_LOCATION") {
            settings.backend.common_mut().requirements_location = if location.is_empty() {
                None
            } else {
                Some(PathBuf::from(location))
            };
        }
        if let Some(cache_dir) = var("CACHE_DIR") {
            settings.cache = CacheConfig::File {
                path: PathBuf::from(cache_dir),
            };
        }

        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(PinrunError::Configuration(format!(
            "Invalid boolean '{}' for {}",
            other, name
        ))),
    }
}
