//! Repository registration — per-team symlinks to real local repos.
//!
//! Registered repos are symlinks in `teams/<uuid>/repos/<name>`
//! pointing at the repository root on the user's disk. No clones are
//! made; only local repos with a `.git` directory are supported.

use std::path::{Path, PathBuf};

use delegate_core::config::{read_repos, write_repos, ApprovalMode, RepoConfig};
use delegate_core::error::{DelegateError, Result};
use delegate_core::paths::Home;

/// Derive a repo name from a local path: last segment, sanitized.
fn derive_name(source: &str) -> String {
    let trimmed = source.trim_end_matches('/');
    let name = trimmed.rsplit('/').next().unwrap_or(trimmed);
    let name: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        "repo".to_string()
    } else {
        name
    }
}

/// The canonical repo path (the symlink location) inside team repos/.
pub fn get_repo_path(home: &Home, team_uuid: &str, name: &str) -> PathBuf {
    home.repo_path(team_uuid, name)
}

/// Register a local repository for a team. Returns the name used.
///
/// Re-registering updates the symlink target when the path moved and
/// applies explicit approval/test_cmd overrides.
pub fn register_repo(
    home: &Home,
    team: &str,
    team_uuid: &str,
    source: &str,
    name: Option<&str>,
    approval: Option<ApprovalMode>,
    test_cmd: Option<&str>,
) -> Result<String> {
    if source.starts_with("http://")
        || source.starts_with("https://")
        || source.starts_with("git@")
        || source.starts_with("ssh://")
    {
        return Err(DelegateError::Validation(format!(
            "remote URLs are not supported; only local paths with .git/ are allowed: {source}"
        )));
    }

    let expanded = shellexpand::tilde(source).to_string();
    let source_path = Path::new(&expanded)
        .canonicalize()
        .map_err(|_| DelegateError::NotFound(format!("repository path not found: {expanded}")))?;
    if !source_path.is_dir() {
        return Err(DelegateError::NotFound(format!(
            "repository path not found: {}",
            source_path.display()
        )));
    }
    if !source_path.join(".git").exists() {
        return Err(DelegateError::Validation(format!(
            "no .git directory found at {}; only local git repositories are supported",
            source_path.display()
        )));
    }

    let name = name
        .map(str::to_string)
        .unwrap_or_else(|| derive_name(source));
    let link_path = get_repo_path(home, team_uuid, &name);

    let mut repos = read_repos(home, team)?;
    if link_path.is_symlink() || link_path.exists() {
        let current_target = link_path.canonicalize().ok();
        if current_target.as_deref() != Some(source_path.as_path()) {
            tracing::info!(
                "repo '{}' symlink target changed -> {}",
                name,
                source_path.display()
            );
            std::fs::remove_file(&link_path)?;
            symlink(&source_path, &link_path)?;
        }
        if let Some(entry) = repos.get_mut(&name) {
            entry.source = source_path.display().to_string();
            if let Some(approval) = approval {
                entry.approval = approval;
            }
            if let Some(test_cmd) = test_cmd {
                entry.test_cmd = Some(test_cmd.to_string());
            }
        }
    } else {
        if let Some(parent) = link_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        symlink(&source_path, &link_path)?;
        repos.insert(
            name.clone(),
            RepoConfig {
                source: source_path.display().to_string(),
                approval: approval.unwrap_or_default(),
                test_cmd: test_cmd.map(str::to_string),
            },
        );
    }
    write_repos(home, team, &repos)?;

    tracing::info!(
        "registered repo '{}' for team '{}' from {}",
        name,
        team,
        source_path.display()
    );
    Ok(name)
}

/// Point a registered repo's symlink at a new location on disk.
pub fn update_repo_path(
    home: &Home,
    team: &str,
    team_uuid: &str,
    name: &str,
    new_path: &str,
) -> Result<()> {
    let link_path = get_repo_path(home, team_uuid, name);
    if !link_path.is_symlink() && !link_path.exists() {
        return Err(DelegateError::NotFound(format!(
            "repo '{name}' is not registered for team '{team}'"
        )));
    }

    let expanded = shellexpand::tilde(new_path).to_string();
    let new_source = Path::new(&expanded)
        .canonicalize()
        .map_err(|_| DelegateError::NotFound(format!("new path not found: {expanded}")))?;
    if !new_source.join(".git").exists() {
        return Err(DelegateError::Validation(format!(
            "no .git directory at {}",
            new_source.display()
        )));
    }

    if link_path.is_symlink() {
        std::fs::remove_file(&link_path)?;
    }
    symlink(&new_source, &link_path)?;

    let mut repos = read_repos(home, team)?;
    if let Some(entry) = repos.get_mut(name) {
        entry.source = new_source.display().to_string();
        write_repos(home, team, &repos)?;
    }
    tracing::info!("updated repo '{}' symlink -> {}", name, new_source.display());
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::windows::fs::symlink_dir(target, link).map_err(Into::into)
}
