//! Settings for the task runner
//!
//! Settings come from a YAML document (or `Settings::default()`), are overlaid
//! with `PINRUN_*` environment variables and validated once before the runner
//! is built. They are immutable afterwards.

pub mod loader;
pub mod types;
pub mod validation;

pub use loader::*;
pub use types::*;


use crate::errors::Result;
use std::path::Path;

/// Load settings from a YAML file
pub async fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings> {
    SettingsLoader::from_file(path).await
}
