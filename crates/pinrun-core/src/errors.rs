//! Error types for every failure mode of a task run
//!
//! Each variant corresponds to one class of failure a caller may want to react
//! to differently: bad settings, an unreachable repository, a dependency
//! mismatch, a failed or timed-out build, and static file lookups that escape
//! the working copy. No variant is retried internally; the single attempt's
//! error is surfaced as-is.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PinrunError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Task misconfigured: {0}")]
    TaskMisconfigured(String),
    #[error("Repository error: {0}")]
    Repository(String),
    #[error("Requirements mismatch, extra requirements: {}", .extras.join(", "))]
    RequirementsMismatch { extras: Vec<String> },
    #[error("Build failed: {message}\n\n{diagnostics}")]
    Build { message: String, diagnostics: String },
    #[error("Build timed out after {seconds}s: {context}")]
    BuildTimeout { seconds: u64, context: String },
    #[error("{0} is not inside the repository")]
    FileOutOfRange(PathBuf),
    #[error("{0} does not exist in the repository")]
    FileNotFound(PathBuf),
    #[error("I/O error: {0}")]
    Io(String),
}

/// Coarse classification of [`PinrunError`], one per error kind of the taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Repository,
    RequirementsMismatch,
    Build,
    BuildTimeout,
    FileOutOfRange,
    FileNotFound,
}

impl PinrunError {
    pub fn build(message: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        PinrunError::Build {
            message: message.into(),
            diagnostics: diagnostics.into(),
        }
    }

    pub fn timeout(seconds: u64, context: impl Into<String>) -> Self {
        PinrunError::BuildTimeout {
            seconds,
            context: context.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PinrunError::BuildTimeout { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PinrunError::Configuration(_) | PinrunError::TaskMisconfigured(_) => {
                ErrorKind::Configuration
            }
            PinrunError::Repository(_) => ErrorKind::Repository,
            PinrunError::RequirementsMismatch { .. } => ErrorKind::RequirementsMismatch,
            PinrunError::Build { .. } | PinrunError::Io(_) => ErrorKind::Build,
            PinrunError::BuildTimeout { .. } => ErrorKind::BuildTimeout,
            PinrunError::FileOutOfRange(_) => ErrorKind::FileOutOfRange,
            PinrunError::FileNotFound(_) => ErrorKind::FileNotFound,
        }
    }
}

impl From<std::io::Error> for PinrunError {
    fn from(err: std::io::Error) -> Self {
        PinrunError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PinrunError {
    fn from(err: serde_json::Error) -> Self {
        PinrunError::build("Malformed JSON", err.to_string())
    }
}

impl From<serde_yaml::Error> for PinrunError {
    fn from(err: serde_yaml::Error) -> Self {
        PinrunError::Configuration(format!("Failed to parse YAML settings: {}", err))
    }
}

impl From<bollard::errors::Error> for PinrunError {
    fn from(err: bollard::errors::Error) -> Self {
        PinrunError::build("Docker operation failed", err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PinrunError>;
