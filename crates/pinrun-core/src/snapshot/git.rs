//! Thin async wrapper over the `git` command line

use crate::errors::{PinrunError, Result};
use crate::process;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct Git {
    program: PathBuf,
}

impl Default for Git {
    fn default() -> Self {
        Self::new("git")
    }
}

impl Git {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn git(&self, cwd: Option<&Path>, args: Vec<OsString>) -> Result<String> {
        let mut command = Command::new(&self.program);
        command.args(&args).env("GIT_TERMINAL_PROMPT", "0");
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let description = process::describe(&command);

        let output = process::run(command, None)
            .await
            .map_err(|e| PinrunError::Repository(format!("`{}` could not run: {}", description, e)))?;
        if !output.success() {
            return Err(PinrunError::Repository(format!(
                "`{}` failed: {}",
                description,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Clones a single branch into `destination`.
    pub async fn clone_branch(
        &self,
        url: &str,
        branch: &str,
        destination: &Path,
        depth: Option<u32>,
        reference: Option<&Path>,
    ) -> Result<()> {
        let mut args: Vec<OsString> = vec!["clone".into(), "--branch".into(), branch.into()];
        if let Some(depth) = depth {
            args.push("--depth".into());
            args.push(depth.to_string().into());
        }
        if let Some(reference) = reference {
            args.push("--reference-if-able".into());
            args.push(reference.as_os_str().to_owned());
            args.push("--dissociate".into());
        }
        args.push("--".into());
        args.push(url.into());
        args.push(destination.as_os_str().to_owned());

        self.git(None, args).await.map(|_| ())
    }

    /// `git fetch origin <branch>` followed by a hard reset onto it.
    pub async fn fetch_and_reset(&self, path: &Path, branch: &str) -> Result<()> {
        self.git(Some(path), vec!["fetch".into(), "origin".into(), branch.into()])
            .await?;
        self.git(
            Some(path),
            vec![
                "reset".into(),
                "--hard".into(),
                format!("origin/{}", branch).into(),
            ],
        )
        .await
        .map(|_| ())
    }

    pub async fn head(&self, path: &Path) -> Result<String> {
        let output = self
            .git(Some(path), vec!["rev-parse".into(), "HEAD".into()])
            .await?;
        Ok(output.trim().to_string())
    }
}

/// A clone made with `--depth` cannot lend its objects to another clone.
pub fn is_shallow(path: &Path) -> bool {
    path.join(".git").join("shallow").exists()
}

pub fn is_working_copy(path: &Path) -> bool {
    path.join(".git").exists()
}
