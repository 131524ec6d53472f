//! Tool permission enforcement for agent subprocesses.
//!
//! The guard inspects every tool invocation other than known
//! read-only tools: path-writing tools must target one of the allowed
//! write paths (resolved against the Telephone's cwd, symlinks
//! followed), and bash commands are checked against a substring
//! deny-list.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::sdk::{PermissionDecision, PermissionGuard};

/// Tools that can write files — checked against the write allowlist.
const WRITE_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit"];

/// Tools known to be read-only. Bash is handled separately via the
/// deny-list plus the OS sandbox. Any tool outside this set carrying a
/// path parameter gets the write check, which future-proofs against
/// new write-capable tools.
const READ_ONLY_TOOLS: &[&str] = &[
    "Read",
    "Grep",
    "Glob",
    "LS",
    "NotebookRead",
    "View",
    "Bash",
    "TodoRead",
    "TodoWrite",
];

/// Permission configuration for one Telephone.
#[derive(Debug, Clone, Default)]
pub struct GuardConfig {
    /// Base for resolving relative tool paths.
    pub cwd: PathBuf,
    /// Paths where write tools may operate; `None` means unrestricted.
    pub allowed_write_paths: Option<Vec<PathBuf>>,
    /// Substrings that deny a bash command when contained in it.
    pub denied_bash_patterns: Vec<String>,
}

impl GuardConfig {
    /// Whether this configuration restricts anything at all.
    pub fn is_restrictive(&self) -> bool {
        self.allowed_write_paths.is_some() || !self.denied_bash_patterns.is_empty()
    }

    /// Evaluate one tool invocation.
    pub fn check(&self, tool_name: &str, tool_input: &serde_json::Value) -> PermissionDecision {
        // Write-path isolation.
        if let Some(write_paths) = &self.allowed_write_paths {
            if !READ_ONLY_TOOLS.contains(&tool_name) {
                let file_path = tool_input
                    .get("file_path")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .or_else(|| {
                        tool_input
                            .get("notebook_path")
                            .and_then(|v| v.as_str())
                            .filter(|s| !s.is_empty())
                    });
                if let Some(file_path) = file_path {
                    let resolved = resolve_against(&self.cwd, Path::new(file_path));
                    let allowed = write_paths.iter().any(|wp| {
                        let wp = resolve_against(&self.cwd, wp);
                        resolved == wp || resolved.starts_with(&wp)
                    });
                    if !allowed {
                        return PermissionDecision::Deny {
                            message: format!(
                                "Write denied: {file_path} is outside allowed paths {:?}",
                                write_paths
                                    .iter()
                                    .map(|p| p.display().to_string())
                                    .collect::<Vec<_>>()
                            ),
                        };
                    }
                }
            }
        }

        // Bash deny-list.
        if tool_name == "Bash" && !self.denied_bash_patterns.is_empty() {
            let command = tool_input
                .get("command")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            for pattern in &self.denied_bash_patterns {
                if command.contains(pattern.as_str()) {
                    return PermissionDecision::Deny {
                        message: format!("Command denied: contains '{pattern}'"),
                    };
                }
            }
        }

        PermissionDecision::Allow
    }

    /// Build the callback handed to the SDK, or `None` when nothing is
    /// restricted (unattended permission mode applies instead).
    pub fn make_guard(&self) -> Option<PermissionGuard> {
        if !self.is_restrictive() {
            return None;
        }
        let config = self.clone();
        Some(Arc::new(move |tool_name, tool_input| {
            config.check(tool_name, tool_input)
        }))
    }
}

/// Resolve a path against a base, following symlinks where the target
/// exists. Non-existent leaves resolve through their deepest existing
/// ancestor so symlink escapes are still caught.
fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    if let Ok(resolved) = joined.canonicalize() {
        return resolved;
    }
    // Canonicalize the deepest existing ancestor, then append the rest.
    let mut existing = joined.clone();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return joined,
        }
    }
    let mut resolved = existing.canonicalize().unwrap_or(existing);
    for part in tail.into_iter().rev() {
        resolved.push(part);
    }
    resolved
}

/// True when a tool is one of the known write tools (used by tests and
/// the activity formatter).
pub fn is_write_tool(name: &str) -> bool {
    WRITE_TOOLS.contains(&name)
}
