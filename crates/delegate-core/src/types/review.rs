//! Review model — per-attempt reviews, review comments, task comments.

use serde::{Deserialize, Serialize};

/// Review verdict; `None` while the review is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approved,
    Rejected,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A row in `reviews`, unique per `(task_id, attempt)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub id: i64,
    pub task_id: i64,
    pub attempt: i64,
    pub verdict: Option<Verdict>,
    pub summary: String,
    pub reviewer: String,
    pub created_at: String,
    pub decided_at: Option<String>,
    pub team_uuid: String,
    pub reviewer_uuid: String,
}

/// An inline review comment, append-only per attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewComment {
    pub id: i64,
    pub task_id: i64,
    pub attempt: i64,
    pub file: String,
    pub line: Option<i64>,
    pub body: String,
    pub author: String,
    pub created_at: String,
}

/// A free-form comment on a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskComment {
    pub id: i64,
    pub task_id: i64,
    pub author: String,
    pub body: String,
    pub created_at: String,
}
