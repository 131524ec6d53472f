//! Centralized path computations.
//!
//! All state lives under a single home directory (`~/.delegate` by
//! default, `DELEGATE_HOME` overrides for testing). The `protected/`
//! subtree holds infrastructure that agent subprocesses never see;
//! `teams/` holds the agent-visible working data, keyed by team UUID.

use std::path::{Path, PathBuf};

/// Format an integer task id as the user-visible `T<nnnn>` form.
pub fn format_task_id(task_id: i64) -> String {
    format!("T{task_id:04}")
}

/// The Delegate home directory plus path helpers for everything below it.
///
/// A `Home` is cheap to clone and carries no open resources; it is the
/// root every subsystem resolves paths against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Home {
    root: PathBuf,
}

impl Home {
    /// Resolve the home directory.
    ///
    /// Resolution order:
    /// 1. explicit override (tests)
    /// 2. `DELEGATE_HOME` environment variable
    /// 3. `~/.delegate`
    pub fn resolve(override_path: Option<PathBuf>) -> Self {
        if let Some(p) = override_path {
            return Self { root: p };
        }
        if let Ok(env) = std::env::var("DELEGATE_HOME") {
            if !env.is_empty() {
                return Self {
                    root: PathBuf::from(env),
                };
            }
        }
        let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            root: base.join(".delegate"),
        }
    }

    /// Wrap an explicit root (used pervasively in tests).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── protected/ (infrastructure, outside the agent sandbox) ─────

    pub fn protected_dir(&self) -> PathBuf {
        self.root.join("protected")
    }

    pub fn db_path(&self) -> PathBuf {
        self.protected_dir().join("db.sqlite")
    }

    pub fn db_backup_path(&self, version: i64, timestamp: &str) -> PathBuf {
        self.protected_dir()
            .join(format!("db.sqlite.bak.V{version}.{timestamp}"))
    }

    pub fn daemon_pid_path(&self) -> PathBuf {
        self.protected_dir().join("daemon.pid")
    }

    pub fn daemon_lock_path(&self) -> PathBuf {
        self.protected_dir().join("daemon.lock")
    }

    pub fn config_path(&self) -> PathBuf {
        self.protected_dir().join("config.yaml")
    }

    pub fn members_dir(&self) -> PathBuf {
        self.protected_dir().join("members")
    }

    pub fn member_file(&self, name: &str) -> PathBuf {
        self.members_dir().join(format!("{name}.yaml"))
    }

    /// Protected per-team metadata (repos.yaml, team_id), keyed by name.
    pub fn protected_team_dir(&self, team: &str) -> PathBuf {
        self.protected_dir().join("teams").join(team)
    }

    pub fn repos_config_path(&self, team: &str) -> PathBuf {
        self.protected_team_dir(team).join("repos.yaml")
    }

    pub fn team_id_path(&self, team: &str) -> PathBuf {
        self.protected_team_dir(team).join("team_id")
    }

    // ── teams/ (agent-visible working data, keyed by team UUID) ────

    pub fn teams_dir(&self) -> PathBuf {
        self.root.join("teams")
    }

    pub fn team_dir(&self, team_uuid: &str) -> PathBuf {
        self.teams_dir().join(team_uuid)
    }

    pub fn shared_dir(&self, team_uuid: &str) -> PathBuf {
        self.team_dir(team_uuid).join("shared")
    }

    pub fn agents_dir(&self, team_uuid: &str) -> PathBuf {
        self.team_dir(team_uuid).join("agents")
    }

    pub fn agent_dir(&self, team_uuid: &str, agent: &str) -> PathBuf {
        self.agents_dir(team_uuid).join(agent)
    }

    pub fn agent_state_path(&self, team_uuid: &str, agent: &str) -> PathBuf {
        self.agent_dir(team_uuid, agent).join("state.yaml")
    }

    pub fn agent_context_path(&self, team_uuid: &str, agent: &str) -> PathBuf {
        self.agent_dir(team_uuid, agent).join("context.md")
    }

    pub fn agent_logs_dir(&self, team_uuid: &str, agent: &str) -> PathBuf {
        self.agent_dir(team_uuid, agent).join("logs")
    }

    pub fn agent_notes_dir(&self, team_uuid: &str, agent: &str) -> PathBuf {
        self.agent_dir(team_uuid, agent).join("notes")
    }

    pub fn agent_journal_path(&self, team_uuid: &str, agent: &str, task_id: i64) -> PathBuf {
        self.agent_dir(team_uuid, agent)
            .join("journals")
            .join(format!("{}.md", format_task_id(task_id)))
    }

    pub fn agent_workspace_dir(&self, team_uuid: &str, agent: &str) -> PathBuf {
        self.agent_dir(team_uuid, agent).join("workspace")
    }

    // ── repos and worktrees ────────────────────────────────────────

    pub fn repos_dir(&self, team_uuid: &str) -> PathBuf {
        self.team_dir(team_uuid).join("repos")
    }

    /// The symlink location for a registered repo.
    pub fn repo_path(&self, team_uuid: &str, repo: &str) -> PathBuf {
        self.repos_dir(team_uuid).join(repo)
    }

    pub fn worktrees_dir(&self, team_uuid: &str) -> PathBuf {
        self.team_dir(team_uuid).join("worktrees")
    }

    /// The shared per-task worktree: `worktrees/<repo>/T<nnnn>/`.
    pub fn task_worktree_dir(&self, team_uuid: &str, repo: &str, task_id: i64) -> PathBuf {
        self.worktrees_dir(team_uuid)
            .join(repo)
            .join(format_task_id(task_id))
    }

    /// Disposable merge worktree: `worktrees/_merge/<uid>/T<nnnn>/`.
    pub fn merge_worktree_dir(&self, team_uuid: &str, uid: &str, task_id: i64) -> PathBuf {
        self.worktrees_dir(team_uuid)
            .join("_merge")
            .join(uid)
            .join(format_task_id(task_id))
    }

    /// Disposable reviewer-edit worktree: `worktrees/_review/<uid>/`.
    pub fn review_worktree_dir(&self, team_uuid: &str, uid: &str) -> PathBuf {
        self.worktrees_dir(team_uuid).join("_review").join(uid)
    }

    pub fn uploads_dir(&self, team_uuid: &str, year: u32, month: u32) -> PathBuf {
        self.team_dir(team_uuid)
            .join("uploads")
            .join(format!("{year:04}"))
            .join(format!("{month:02}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_task_id() {
        assert_eq!(format_task_id(1), "T0001");
        assert_eq!(format_task_id(42), "T0042");
        assert_eq!(format_task_id(12345), "T12345");
    }

    #[test]
    fn test_home_at() {
        let home = Home::at("/tmp/dg-test");
        assert_eq!(home.root(), Path::new("/tmp/dg-test"));
        assert_eq!(home.db_path(), Path::new("/tmp/dg-test/protected/db.sqlite"));
    }

    #[test]
    fn test_resolve_override_wins() {
        let home = Home::resolve(Some(PathBuf::from("/tmp/override")));
        assert_eq!(home.root(), Path::new("/tmp/override"));
    }

    #[test]
    fn test_worktree_layout() {
        let home = Home::at("/h");
        assert_eq!(
            home.task_worktree_dir("abc123", "myrepo", 7),
            Path::new("/h/teams/abc123/worktrees/myrepo/T0007")
        );
        assert_eq!(
            home.merge_worktree_dir("abc123", "deadbeef0123", 7),
            Path::new("/h/teams/abc123/worktrees/_merge/deadbeef0123/T0007")
        );
    }

    #[test]
    fn test_protected_split() {
        let home = Home::at("/h");
        // protected/ is disjoint from teams/ (the agent-visible subtree)
        assert!(home.db_path().starts_with("/h/protected"));
        assert!(home.team_dir("u").starts_with("/h/teams"));
        assert_eq!(home.member_file("alice"), Path::new("/h/protected/members/alice.yaml"));
        assert_eq!(
            home.repos_config_path("myteam"),
            Path::new("/h/protected/teams/myteam/repos.yaml")
        );
    }
}
