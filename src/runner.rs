use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::ExecutionError;

/// Captured output of one external tool invocation.
///
/// A non-zero exit code is not an error by itself: several RAID utilities
/// exit non-zero on benign conditions while still printing a usable report.
/// Callers inspect `exit_code` together with stdout/stderr.
#[derive(Debug)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run an external tool with a hard timeout.
///
/// Arguments are passed as discrete tokens; nothing goes through a shell.
/// On timeout the child is killed and `ExecutionError::Timeout` is returned,
/// so a hung tool can never block a scrape past its budget.
pub async fn run(path: &Path, args: &[&str], timeout: Duration) -> Result<Output, ExecutionError> {
    let tool = path.display().to_string();
    tracing::debug!(tool = %tool, ?args, "Running command");

    let mut command = Command::new(path);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ExecutionError::NotFound { tool: tool.clone() },
        std::io::ErrorKind::PermissionDenied => ExecutionError::PermissionDenied {
            tool: tool.clone(),
        },
        _ => ExecutionError::Io {
            tool: tool.clone(),
            source: e,
        },
    })?;

    // kill_on_drop reaps the child when the future is dropped at the deadline
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| ExecutionError::Io {
            tool: tool.clone(),
            source: e,
        })?,
        Err(_) => return Err(ExecutionError::Timeout { tool, timeout }),
    };

    Ok(Output {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Resolve a tool binary: an explicit override path wins, otherwise search
/// `PATH`. Returns `None` when the tool is not installed, which collectors
/// report as unavailability rather than a failure.
pub fn resolve_tool(name: &str, override_path: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = override_path {
        let path = PathBuf::from(path);
        return path.is_file().then_some(path);
    }

    let paths = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&paths) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
