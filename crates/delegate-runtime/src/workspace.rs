//! Workspace resolution for a turn — which directory the agent runs
//! in, and the per-repo worktree map included in the prompt.

use std::collections::BTreeMap;
use std::path::PathBuf;

use delegate_core::error::Result;
use delegate_core::paths::Home;
use delegate_core::types::Task;

/// Determine the cwd and per-repo worktree paths for a turn.
///
/// For a task with repos, the first existing worktree becomes the cwd;
/// otherwise the agent's own workspace directory (created on demand).
pub fn resolve_workspace(
    home: &Home,
    team_uuid: &str,
    agent: &str,
    task: Option<&Task>,
) -> Result<(PathBuf, BTreeMap<String, PathBuf>)> {
    let fallback = home.agent_workspace_dir(team_uuid, agent);
    std::fs::create_dir_all(&fallback)?;

    let Some(task) = task else {
        return Ok((fallback, BTreeMap::new()));
    };
    if task.repos.is_empty() {
        return Ok((fallback, BTreeMap::new()));
    }

    let mut workspace_paths = BTreeMap::new();
    let mut cwd = fallback;
    for (i, repo_name) in task.repos.iter().enumerate() {
        let wt = home.task_worktree_dir(team_uuid, repo_name, task.id);
        if wt.is_dir() {
            if i == 0 {
                cwd = wt.clone();
            }
            workspace_paths.insert(repo_name.clone(), wt);
        }
    }
    Ok((cwd, workspace_paths))
}
