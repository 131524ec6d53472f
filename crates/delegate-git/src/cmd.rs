//! Git subprocess wrapper with per-call timeouts.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use delegate_core::error::{DelegateError, Result};

/// Default timeout for mutating git operations (rebases, commits).
pub const GIT_TIMEOUT_SECS: u64 = 120;
/// Timeout for quick status checks.
pub const GIT_STATUS_TIMEOUT_SECS: u64 = 30;

/// Captured output of a git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn ok(&self) -> bool {
        self.status == 0
    }

    /// Trimmed stdout — the usual shape for rev-parse and friends.
    pub fn out(&self) -> String {
        self.stdout.trim().to_string()
    }

    /// stderr + stdout, for error messages.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stderr, self.stdout)
    }
}

/// Run `git <args>` in `cwd` with the default 120 s timeout.
pub async fn git(args: &[&str], cwd: &Path) -> Result<GitOutput> {
    git_in(args, cwd, GIT_TIMEOUT_SECS).await
}

/// Run `git <args>` in `cwd` with an explicit timeout.
pub async fn git_in(args: &[&str], cwd: &Path, timeout_secs: u64) -> Result<GitOutput> {
    let fut = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();
    let output = tokio::time::timeout(Duration::from_secs(timeout_secs), fut)
        .await
        .map_err(|_| {
            DelegateError::Timeout(format!("git {} timed out after {timeout_secs}s", args.join(" ")))
        })?
        .map_err(|e| DelegateError::Git(format!("git {}: {e}", args.join(" "))))?;
    Ok(GitOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Run `git <args>` feeding `input` on stdin (used for `git apply`).
pub async fn git_stdin(args: &[&str], cwd: &Path, input: &str) -> Result<GitOutput> {
    let mut child = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| DelegateError::Git(format!("git {}: {e}", args.join(" "))))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| DelegateError::Git(format!("git stdin: {e}")))?;
        drop(stdin);
    }

    let output = tokio::time::timeout(
        Duration::from_secs(GIT_TIMEOUT_SECS),
        child.wait_with_output(),
    )
    .await
    .map_err(|_| {
        DelegateError::Timeout(format!(
            "git {} timed out after {GIT_TIMEOUT_SECS}s",
            args.join(" ")
        ))
    })?
    .map_err(|e| DelegateError::Git(format!("git {}: {e}", args.join(" "))))?;

    Ok(GitOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_git_version_runs() {
        let dir = tempfile::tempdir().unwrap();
        let out = git(&["--version"], dir.path()).await.unwrap();
        assert!(out.ok());
        assert!(out.out().starts_with("git version"));
    }

    #[tokio::test]
    async fn test_failed_command_reports_status() {
        let dir = tempfile::tempdir().unwrap();
        // Not a repository: rev-parse fails but the wrapper succeeds.
        let out = git_in(&["rev-parse", "HEAD"], dir.path(), GIT_STATUS_TIMEOUT_SECS)
            .await
            .unwrap();
        assert!(!out.ok());
        assert!(!out.combined().is_empty());
    }
}
