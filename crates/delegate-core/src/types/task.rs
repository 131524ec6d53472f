//! Task model — status machine, per-repo maps, and legacy JSON decoding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    InReview,
    InApproval,
    Merging,
    Done,
    Rejected,
    Cancelled,
    MergeFailed,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::InApproval => "in_approval",
            Self::Merging => "merging",
            Self::Done => "done",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::MergeFailed => "merge_failed",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "todo" => Some(Self::Todo),
            "in_progress" => Some(Self::InProgress),
            "in_review" => Some(Self::InReview),
            "in_approval" => Some(Self::InApproval),
            "merging" => Some(Self::Merging),
            "done" => Some(Self::Done),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            "merge_failed" => Some(Self::MergeFailed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Terminal statuses stamp `completed_at` and stop the pipeline.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Error)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task row, with JSON columns decoded to their canonical shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub dri: String,
    pub assignee: String,
    /// Registered repo names (multi-repo).
    pub repos: Vec<String>,
    pub tags: Vec<String>,
    pub depends_on: Vec<i64>,
    pub attachments: Vec<String>,
    pub branch: String,
    /// repo name -> main HEAD at worktree creation (rebase base).
    pub base_sha: BTreeMap<String, String>,
    /// repo name -> feature commit SHAs.
    pub commits: BTreeMap<String, Vec<String>>,
    /// repo name -> main SHA just before the fast-forward.
    pub merge_base: BTreeMap<String, String>,
    /// repo name -> main SHA just after the fast-forward.
    pub merge_tip: BTreeMap<String, String>,
    pub review_attempt: i64,
    pub merge_attempts: i64,
    pub status_detail: String,
    /// Unix timestamp gate for the next merge retry, if scheduled.
    pub retry_after: Option<f64>,
    pub workflow: String,
    pub workflow_version: i64,
    pub metadata: serde_json::Value,
    pub team: String,
    pub team_uuid: String,
    pub dri_uuid: String,
    pub assignee_uuid: String,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: String,
}

impl Task {
    /// User-visible id, `T<nnnn>`.
    pub fn display_id(&self) -> String {
        crate::paths::format_task_id(self.id)
    }
}

// ── Legacy JSON column decoding ────────────────────────────────────
//
// JSON list columns (repo, tags, depends_on, attachments) may hold a
// JSON array, a bare JSON string, or a legacy non-JSON plain string.
// JSON dict columns (base_sha, commits, merge_base, merge_tip) may hold
// a dict, a legacy flat list, or a legacy plain-string value keyed under
// the task's first repo.

/// Decode a JSON list column, tolerating legacy string forms.
pub fn decode_json_list(raw: &str) -> Vec<String> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s),
                other => Some(other.to_string()),
            })
            .collect(),
        Ok(serde_json::Value::String(s)) if !s.is_empty() => vec![s],
        Ok(_) => Vec::new(),
        Err(_) => {
            // Non-JSON plain string (legacy repo = "myrepo")
            if raw.is_empty() || raw == "[]" {
                Vec::new()
            } else {
                vec![raw.to_string()]
            }
        }
    }
}

/// Decode a JSON dict column of string values, tolerating legacy shapes.
///
/// `first_repo` keys legacy scalar/list forms (old single-repo tasks
/// stored a bare SHA string).
pub fn decode_json_dict(raw: &str, first_repo: Option<&str>) -> BTreeMap<String, String> {
    let key = first_repo.unwrap_or("_default");
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => map
            .into_iter()
            .filter_map(|(k, v)| match v {
                serde_json::Value::String(s) => Some((k, s)),
                _ => None,
            })
            .collect(),
        Ok(serde_json::Value::String(s)) if !s.is_empty() => {
            BTreeMap::from([(key.to_string(), s)])
        }
        Ok(_) => BTreeMap::new(),
        Err(_) => {
            if raw.is_empty() || raw == "{}" || raw == "[]" {
                BTreeMap::new()
            } else {
                BTreeMap::from([(key.to_string(), raw.to_string())])
            }
        }
    }
}

/// Decode the `commits` column: dict of repo -> list, with the legacy
/// flat-list form keyed under the first repo.
pub fn decode_commits(raw: &str, first_repo: Option<&str>) -> BTreeMap<String, Vec<String>> {
    let key = first_repo.unwrap_or("_default");
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => map
            .into_iter()
            .map(|(k, v)| {
                let shas = match v {
                    serde_json::Value::Array(items) => items
                        .into_iter()
                        .filter_map(|x| x.as_str().map(str::to_string))
                        .collect(),
                    _ => Vec::new(),
                };
                (k, shas)
            })
            .collect(),
        Ok(serde_json::Value::Array(items)) if !items.is_empty() => {
            let shas: Vec<String> = items
                .into_iter()
                .filter_map(|x| x.as_str().map(str::to_string))
                .collect();
            BTreeMap::from([(key.to_string(), shas)])
        }
        _ => BTreeMap::new(),
    }
}

/// Decode `depends_on`: a JSON list of task ids, tolerating strings.
pub fn decode_depends_on(raw: &str) -> Vec<i64> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::Number(n) => n.as_i64(),
                serde_json::Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in [
            "todo",
            "in_progress",
            "in_review",
            "in_approval",
            "merging",
            "done",
            "rejected",
            "cancelled",
            "merge_failed",
            "error",
        ] {
            let parsed = TaskStatus::parse(s).unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
        assert!(!TaskStatus::Merging.is_terminal());
        assert!(!TaskStatus::MergeFailed.is_terminal());
    }

    #[test]
    fn test_decode_json_list_canonical() {
        assert_eq!(decode_json_list(r#"["a","b"]"#), vec!["a", "b"]);
        assert_eq!(decode_json_list("[]"), Vec::<String>::new());
    }

    #[test]
    fn test_decode_json_list_legacy_forms() {
        // Bare JSON string
        assert_eq!(decode_json_list(r#""myrepo""#), vec!["myrepo"]);
        // Non-JSON plain string
        assert_eq!(decode_json_list("myrepo"), vec!["myrepo"]);
        assert_eq!(decode_json_list(""), Vec::<String>::new());
    }

    #[test]
    fn test_decode_json_dict_canonical() {
        let d = decode_json_dict(r#"{"app":"abc123"}"#, Some("app"));
        assert_eq!(d["app"], "abc123");
    }

    #[test]
    fn test_decode_json_dict_legacy_scalar() {
        // Legacy plain SHA keyed under the first repo
        let d = decode_json_dict("abc123", Some("app"));
        assert_eq!(d["app"], "abc123");
        // JSON string form
        let d = decode_json_dict(r#""abc123""#, Some("app"));
        assert_eq!(d["app"], "abc123");
        // No repos: _default key
        let d = decode_json_dict("abc123", None);
        assert_eq!(d["_default"], "abc123");
        assert!(decode_json_dict("{}", Some("app")).is_empty());
    }

    #[test]
    fn test_decode_commits_legacy_list() {
        let c = decode_commits(r#"["s1","s2"]"#, Some("app"));
        assert_eq!(c["app"], vec!["s1", "s2"]);
        let c = decode_commits(r#"{"app":["s1"]}"#, Some("app"));
        assert_eq!(c["app"], vec!["s1"]);
        assert!(decode_commits("[]", Some("app")).is_empty());
    }

    #[test]
    fn test_decode_depends_on() {
        assert_eq!(decode_depends_on("[1,2,3]"), vec![1, 2, 3]);
        assert_eq!(decode_depends_on(r#"["4"]"#), vec![4]);
        assert_eq!(decode_depends_on("[]"), Vec::<i64>::new());
        assert_eq!(decode_depends_on("garbage"), Vec::<i64>::new());
    }
}
