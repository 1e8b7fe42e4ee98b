//! Launching external tools with captured output and a wall-clock limit

use crate::errors::{PinrunError, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Both streams and the exit code, for attaching to an error.
    pub fn diagnostics(&self) -> String {
        format!(
            "exit code: {:?}\nstdout:\n{}\nstderr:\n{}",
            self.exit_code, self.stdout, self.stderr
        )
    }
}

pub fn describe(command: &Command) -> String {
    let std_command = command.as_std();
    let mut parts = vec![std_command.get_program().to_string_lossy().to_string()];
    parts.extend(std_command.get_args().map(|arg| arg.to_string_lossy().to_string()));
    parts.join(" ")
}

/// Runs `command` to completion. The child is killed if it outlives `timeout`,
/// in which case no output is returned.
pub async fn run(mut command: Command, timeout: Option<Duration>) -> Result<ProcessOutput> {
    let description = describe(&command);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|e| {
        PinrunError::build(format!("Failed to launch `{}`", description), e.to_string())
    })?;

    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                log::warn!("`{}` exceeded {}s, killed", description, limit.as_secs());
                return Err(PinrunError::timeout(limit.as_secs(), description));
            }
        },
        None => child.wait_with_output().await?,
    };

    let result = ProcessOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };
    log::debug!("`{}` exited with {:?}", description, result.exit_code);
    Ok(result)
}
