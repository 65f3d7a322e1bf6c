//! The `bash` tool — run a shell command inside the agent's sandbox.
//!
//! When a per-agent sandbox directory is configured, the working
//! directory must resolve inside it; otherwise the call is rejected.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

use hub_domain::error::{Error, Result};
use hub_domain::tool::ToolOutcome;

use crate::path::validate_file_path;

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_OUTPUT_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct BashRequest {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Resolve the effective working directory for a bash call.
///
/// With a sandbox: relative `cwd` resolves inside it, absolute or
/// escaping paths are rejected, and no `cwd` means the sandbox root.
/// Without a sandbox the caller's `cwd` is used as-is.
fn resolve_cwd(req_cwd: Option<&str>, sandbox_dir: Option<&Path>) -> Result<Option<PathBuf>> {
    match (req_cwd, sandbox_dir) {
        (None, None) => Ok(None),
        (None, Some(sandbox)) => Ok(Some(sandbox.to_path_buf())),
        (Some(cwd), None) => Ok(Some(PathBuf::from(cwd))),
        (Some(cwd), Some(sandbox)) => {
            std::fs::create_dir_all(sandbox)?;
            let resolved = validate_file_path(cwd, sandbox)
                .map_err(|_| Error::ToolExec(format!("cwd {cwd:?} is outside the sandbox")))?;
            Ok(Some(resolved))
        }
    }
}

/// Run a command via `sh -c`, returning combined output.
pub async fn execute_bash(req: BashRequest, sandbox_dir: Option<&Path>) -> ToolOutcome {
    if let Some(sandbox) = sandbox_dir {
        if let Err(e) = std::fs::create_dir_all(sandbox) {
            return ToolOutcome::error(format!("cannot create sandbox: {e}"));
        }
    }
    let cwd = match resolve_cwd(req.cwd.as_deref(), sandbox_dir) {
        Ok(cwd) => cwd,
        Err(e) => return ToolOutcome::error(e.to_string()),
    };

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&req.command);
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);
    if let Some(dir) = &cwd {
        cmd.current_dir(dir);
    }

    let timeout = Duration::from_secs(req.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return ToolOutcome::error(format!("failed to spawn: {e}")),
        Err(_) => {
            return ToolOutcome::error(format!(
                "command timed out after {}s",
                timeout.as_secs()
            ))
        }
    };

    let mut text = String::new();
    text.push_str(&String::from_utf8_lossy(&output.stdout));
    if !output.stderr.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    if text.len() > MAX_OUTPUT_BYTES {
        text.truncate(MAX_OUTPUT_BYTES);
        text.push_str("\n[output truncated]");
    }

    if output.status.success() {
        ToolOutcome::ok(text)
    } else {
        let code = output.status.code().unwrap_or(-1);
        ToolOutcome::error(format!("exit code {code}\n{text}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_in_sandbox_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        let out = execute_bash(
            BashRequest {
                command: "pwd".into(),
                cwd: None,
                timeout_secs: None,
            },
            Some(tmp.path()),
        )
        .await;
        assert!(!out.is_error);
        let canonical = tmp.path().canonicalize().unwrap();
        assert!(out.content.trim().ends_with(
            canonical.file_name().unwrap().to_str().unwrap()
        ));
    }

    #[tokio::test]
    async fn rejects_cwd_outside_sandbox() {
        let tmp = tempfile::tempdir().unwrap();
        let out = execute_bash(
            BashRequest {
                command: "true".into(),
                cwd: Some("../..".into()),
                timeout_secs: None,
            },
            Some(tmp.path()),
        )
        .await;
        assert!(out.is_error);
        assert!(out.content.contains("sandbox"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_error_outcome() {
        let out = execute_bash(
            BashRequest {
                command: "echo boom >&2; exit 3".into(),
                cwd: None,
                timeout_secs: None,
            },
            None,
        )
        .await;
        assert!(out.is_error);
        assert!(out.content.contains("exit code 3"));
        assert!(out.content.contains("boom"));
    }

    #[tokio::test]
    async fn timeout_kills_command() {
        let out = execute_bash(
            BashRequest {
                command: "sleep 5".into(),
                cwd: None,
                timeout_secs: Some(1),
            },
            None,
        )
        .await;
        assert!(out.is_error);
        assert!(out.content.contains("timed out"));
    }
}
