//! Member identity — AI agents (team-scoped) and humans (global).

use serde::{Deserialize, Serialize};

/// Kind of a member in the `member_ids` translation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberKind {
    /// An AI agent, tied to a team.
    Agent,
    /// A human operator, global across teams.
    Human,
}

impl MemberKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Human => "human",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent" => Some(Self::Agent),
            "human" => Some(Self::Human),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemberKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved member: kind, team (None for humans), name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub uuid: String,
    pub kind: MemberKind,
    pub team_uuid: Option<String>,
    pub name: String,
}
