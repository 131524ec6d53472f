//! YAML configuration files under `protected/` and per-agent state.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DelegateError, Result};
use crate::paths::Home;

/// Global daemon configuration (`protected/config.yaml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// The active operator; their chat messages anchor batch selection.
    #[serde(default)]
    pub default_human: Option<String>,
    /// Daemon poll interval in seconds.
    #[serde(default = "default_interval")]
    pub interval_secs: f64,
    /// HTTP gateway bind address, e.g. "127.0.0.1:8787".
    #[serde(default)]
    pub listen: Option<String>,
}

fn default_interval() -> f64 {
    1.0
}

impl GlobalConfig {
    pub fn load(home: &Home) -> Result<Self> {
        let path = home.config_path();
        if !path.exists() {
            return Ok(Self {
                interval_secs: default_interval(),
                ..Self::default()
            });
        }
        let text = fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn save(&self, home: &Home) -> Result<()> {
        let path = home.config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

/// Merge approval mode for a registered repo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Merge as soon as the task enters `in_approval`.
    Auto,
    /// Require a reviewer verdict of `approved`.
    Manual,
}

impl Default for ApprovalMode {
    fn default() -> Self {
        Self::Manual
    }
}

/// One entry in a team's `repos.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Real path on the user's disk (the symlink target).
    pub source: String,
    #[serde(default)]
    pub approval: ApprovalMode,
    #[serde(default)]
    pub test_cmd: Option<String>,
}

/// Per-team repo registry (`protected/teams/<team>/repos.yaml`).
pub fn read_repos(home: &Home, team: &str) -> Result<BTreeMap<String, RepoConfig>> {
    let path = home.repos_config_path(team);
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let text = fs::read_to_string(&path)?;
    Ok(serde_yaml::from_str(&text)?)
}

pub fn write_repos(home: &Home, team: &str, repos: &BTreeMap<String, RepoConfig>) -> Result<()> {
    let path = home.repos_config_path(team);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, serde_yaml::to_string(repos)?)?;
    Ok(())
}

/// Approval mode for a repo; defaults to manual for unknown repos.
pub fn repo_approval(home: &Home, team: &str, repo: &str) -> ApprovalMode {
    read_repos(home, team)
        .ok()
        .and_then(|m| m.get(repo).map(|r| r.approval))
        .unwrap_or_default()
}

/// A human member record (`protected/members/<name>.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanMember {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// All registered human members, from the members directory.
pub fn human_members(home: &Home) -> Vec<HumanMember> {
    let dir = home.members_dir();
    let Ok(entries) = fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut members = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        if let Ok(text) = fs::read_to_string(&path) {
            if let Ok(member) = serde_yaml::from_str::<HumanMember>(&text) {
                members.push(member);
            }
        }
    }
    members.sort_by(|a, b| a.name.cmp(&b.name));
    members
}

/// The default human: the configured one, else the first registered member.
pub fn default_human(home: &Home) -> Option<String> {
    if let Ok(cfg) = GlobalConfig::load(home) {
        if let Some(name) = cfg.default_human {
            return Some(name);
        }
    }
    human_members(home).into_iter().next().map(|m| m.name)
}

// ── Agent state ────────────────────────────────────────────────────

pub const DEFAULT_MODEL: &str = "sonnet";

/// Per-agent `state.yaml`. Legacy records carry `seniority` instead of
/// an explicit `model`; explicit `model` wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub seniority: Option<String>,
    #[serde(default)]
    pub token_budget: Option<u64>,
    #[serde(default)]
    pub pid: Option<u32>,
}

impl AgentState {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| DelegateError::Config(format!("read {}: {e}", path.display())))?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn role(&self) -> &str {
        self.role.as_deref().unwrap_or("engineer")
    }

    /// Effective model: explicit `model` wins, else the legacy
    /// seniority mapping (senior -> opus, junior -> sonnet).
    pub fn effective_model(&self) -> String {
        if let Some(model) = &self.model {
            if !model.is_empty() {
                return model.clone();
            }
        }
        match self.seniority.as_deref() {
            Some("senior") => "opus".to_string(),
            Some("junior") => "sonnet".to_string(),
            _ => DEFAULT_MODEL.to_string(),
        }
    }
}

/// The manager agent's name for a team, from the agents' state files.
pub fn find_manager(home: &Home, team_uuid: &str) -> Option<String> {
    let agents_dir = home.agents_dir(team_uuid);
    let entries = fs::read_dir(&agents_dir).ok()?;
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    for name in names {
        let state_path = home.agent_state_path(team_uuid, &name);
        if let Ok(state) = AgentState::load(&state_path) {
            if state.role() == "manager" {
                return Some(name);
            }
        }
    }
    None
}
