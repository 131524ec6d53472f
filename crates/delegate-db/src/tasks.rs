//! Task store — CRUD and the status machine over the `tasks` table,
//! plus task comments and the activity timeline.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};

use delegate_core::error::{DelegateError, Result};
use delegate_core::paths::format_task_id;
use delegate_core::types::{
    decode_commits, decode_depends_on, decode_json_dict, decode_json_list, Task, TaskComment,
    TaskStatus,
};
use delegate_workflows::WorkflowRegistry;

use crate::ids::IdRegistry;
use crate::{now_ts, reviews};

const TASK_COLUMNS: &str = "id, title, description, status, dri, assignee, repo, tags, \
     created_at, updated_at, completed_at, depends_on, branch, base_sha, commits, \
     merge_base, merge_tip, attachments, review_attempt, status_detail, merge_attempts, \
     team, workflow, workflow_version, metadata, team_uuid, dri_uuid, assignee_uuid, retry_after";

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status_str: String = row.get(3)?;
    let repo_raw: String = row.get(6)?;
    let repos = decode_json_list(&repo_raw);
    let first_repo = repos.first().map(String::as_str);

    let tags_raw: String = row.get(7)?;
    let depends_raw: String = row.get(11)?;
    let base_sha_raw: String = row.get(13)?;
    let commits_raw: String = row.get(14)?;
    let merge_base_raw: String = row.get(15)?;
    let merge_tip_raw: String = row.get(16)?;
    let attachments_raw: String = row.get(17)?;
    let metadata_raw: String = row.get(24)?;

    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Todo),
        dri: row.get(4)?,
        assignee: row.get(5)?,
        tags: decode_json_list(&tags_raw),
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        completed_at: row.get(10)?,
        depends_on: decode_depends_on(&depends_raw),
        branch: row.get(12)?,
        base_sha: decode_json_dict(&base_sha_raw, first_repo),
        commits: decode_commits(&commits_raw, first_repo),
        merge_base: decode_json_dict(&merge_base_raw, first_repo),
        merge_tip: decode_json_dict(&merge_tip_raw, first_repo),
        attachments: decode_json_list(&attachments_raw),
        review_attempt: row.get(18)?,
        status_detail: row.get(19)?,
        merge_attempts: row.get(20)?,
        team: row.get(21)?,
        workflow: row.get(22)?,
        workflow_version: row.get(23)?,
        metadata: serde_json::from_str(&metadata_raw).unwrap_or(serde_json::Value::Null),
        team_uuid: row.get(25)?,
        dri_uuid: row.get(26)?,
        assignee_uuid: row.get(27)?,
        retry_after: row.get(28)?,
        repos,
    })
}

fn json_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".into())
}

fn json_dict(map: &BTreeMap<String, String>) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".into())
}

/// Fields for a new task; everything else starts at its column default.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub dri: String,
    pub assignee: String,
    pub repos: Vec<String>,
    pub tags: Vec<String>,
    pub depends_on: Vec<i64>,
    /// Explicit branch; derived from the task id when absent and repos
    /// are set.
    pub branch: Option<String>,
    pub workflow: Option<String>,
}

/// Create a task in `todo`, derive its branch, and resolve DRI/assignee
/// names to UUIDs (best-effort).
pub fn create_task(
    conn: &Connection,
    ids: &IdRegistry,
    team: &str,
    new: NewTask,
) -> Result<Task> {
    let now = now_ts();
    let team_uuid = ids.resolve_team(conn, team).unwrap_or_default();
    let dri_uuid = if new.dri.is_empty() || team_uuid.is_empty() {
        String::new()
    } else {
        ids.resolve_member_flexible(conn, &team_uuid, &new.dri)
            .unwrap_or_default()
    };
    let assignee_uuid = if new.assignee.is_empty() || team_uuid.is_empty() {
        String::new()
    } else {
        ids.resolve_member_flexible(conn, &team_uuid, &new.assignee)
            .unwrap_or_default()
    };
    let depends_on = serde_json::to_string(&new.depends_on).unwrap_or_else(|_| "[]".into());

    conn.execute(
        "INSERT INTO tasks
            (title, description, status, dri, assignee, repo, tags, depends_on,
             created_at, updated_at, team, team_uuid, dri_uuid, assignee_uuid, workflow)
         VALUES (?1, ?2, 'todo', ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            new.title,
            new.description,
            new.dri,
            new.assignee,
            json_list(&new.repos),
            json_list(&new.tags),
            depends_on,
            now,
            team,
            team_uuid,
            dri_uuid,
            assignee_uuid,
            new.workflow.as_deref().unwrap_or("default"),
        ],
    )
    .map_err(|e| DelegateError::Database(format!("create_task: {e}")))?;
    let task_id = conn.last_insert_rowid();

    // Derive the branch once the autoincrement id is known.
    let branch = match new.branch {
        Some(branch) => branch,
        None if !new.repos.is_empty() && team_uuid.len() >= 6 => {
            format!(
                "delegate/{}/{}/{}",
                &team_uuid[..6],
                team,
                format_task_id(task_id)
            )
        }
        None => String::new(),
    };
    if !branch.is_empty() {
        conn.execute(
            "UPDATE tasks SET branch = ?1 WHERE id = ?2",
            params![branch, task_id],
        )
        .map_err(|e| DelegateError::Database(format!("create_task branch: {e}")))?;
    }

    get_task(conn, team, task_id)
}

pub fn get_task(conn: &Connection, team: &str, task_id: i64) -> Result<Task> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE team = ?1 AND id = ?2");
    conn.query_row(&sql, params![team, task_id], task_from_row)
        .optional()
        .map_err(|e| DelegateError::Database(format!("get_task: {e}")))?
        .ok_or_else(|| DelegateError::NotFound(format!("task {}", format_task_id(task_id))))
}

/// Legacy aggregate lookup: find a task by id across teams.
pub fn find_task(conn: &Connection, task_id: i64) -> Result<Task> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    conn.query_row(&sql, params![task_id], task_from_row)
        .optional()
        .map_err(|e| DelegateError::Database(format!("find_task: {e}")))?
        .ok_or_else(|| DelegateError::NotFound(format!("task {}", format_task_id(task_id))))
}

/// Optional filters for `list_tasks`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter<'a> {
    pub status: Option<TaskStatus>,
    pub assignee: Option<&'a str>,
    pub dri: Option<&'a str>,
}

pub fn list_tasks(conn: &Connection, team: &str, filter: TaskFilter<'_>) -> Result<Vec<Task>> {
    let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE team = ?1");
    let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(team.to_string())];
    if let Some(status) = filter.status {
        sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
        args.push(Box::new(status.as_str().to_string()));
    }
    if let Some(assignee) = filter.assignee {
        sql.push_str(&format!(" AND assignee = ?{}", args.len() + 1));
        args.push(Box::new(assignee.to_string()));
    }
    if let Some(dri) = filter.dri {
        sql.push_str(&format!(" AND dri = ?{}", args.len() + 1));
        args.push(Box::new(dri.to_string()));
    }
    sql.push_str(" ORDER BY id ASC");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| DelegateError::Database(format!("list_tasks: {e}")))?;
    let params_ref: Vec<&dyn rusqlite::types::ToSql> = args.iter().map(|b| b.as_ref()).collect();
    let rows = stmt
        .query_map(params_ref.as_slice(), task_from_row)
        .map_err(|e| DelegateError::Database(format!("list_tasks: {e}")))?;
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row.map_err(|e| DelegateError::Database(format!("row: {e}")))?);
    }
    Ok(tasks)
}

/// Field updates for `update_task`. Unset fields are untouched; JSON
/// columns are always written in their canonical shape.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub dri: Option<String>,
    pub assignee: Option<String>,
    pub repos: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub depends_on: Option<Vec<i64>>,
    pub attachments: Option<Vec<String>>,
    pub branch: Option<String>,
    pub base_sha: Option<BTreeMap<String, String>>,
    pub commits: Option<BTreeMap<String, Vec<String>>>,
    pub merge_base: Option<BTreeMap<String, String>>,
    pub merge_tip: Option<BTreeMap<String, String>>,
    pub review_attempt: Option<i64>,
    pub merge_attempts: Option<i64>,
    pub status_detail: Option<String>,
    /// `Some(None)` clears a scheduled retry; `Some(Some(t))` sets one.
    pub retry_after: Option<Option<f64>>,
    pub metadata: Option<serde_json::Value>,
}

pub fn update_task(conn: &Connection, team: &str, task_id: i64, patch: TaskPatch) -> Result<()> {
    let mut sets: Vec<String> = vec!["updated_at = ?1".into()];
    let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(now_ts())];

    macro_rules! set {
        ($col:literal, $value:expr) => {{
            args.push(Box::new($value));
            sets.push(format!("{} = ?{}", $col, args.len()));
        }};
    }

    if let Some(v) = patch.title {
        set!("title", v);
    }
    if let Some(v) = patch.description {
        set!("description", v);
    }
    if let Some(v) = patch.dri {
        set!("dri", v);
    }
    if let Some(v) = patch.assignee {
        set!("assignee", v);
    }
    if let Some(v) = patch.repos {
        set!("repo", json_list(&v));
    }
    if let Some(v) = patch.tags {
        set!("tags", json_list(&v));
    }
    if let Some(v) = patch.depends_on {
        set!(
            "depends_on",
            serde_json::to_string(&v).unwrap_or_else(|_| "[]".into())
        );
    }
    if let Some(v) = patch.attachments {
        set!("attachments", json_list(&v));
    }
    if let Some(v) = patch.branch {
        set!("branch", v);
    }
    if let Some(v) = patch.base_sha {
        set!("base_sha", json_dict(&v));
    }
    if let Some(v) = patch.commits {
        set!(
            "commits",
            serde_json::to_string(&v).unwrap_or_else(|_| "{}".into())
        );
    }
    if let Some(v) = patch.merge_base {
        set!("merge_base", json_dict(&v));
    }
    if let Some(v) = patch.merge_tip {
        set!("merge_tip", json_dict(&v));
    }
    if let Some(v) = patch.review_attempt {
        set!("review_attempt", v);
    }
    if let Some(v) = patch.merge_attempts {
        set!("merge_attempts", v);
    }
    if let Some(v) = patch.status_detail {
        set!("status_detail", v);
    }
    if let Some(v) = patch.retry_after {
        set!("retry_after", v);
    }
    if let Some(v) = patch.metadata {
        set!(
            "metadata",
            serde_json::to_string(&v).unwrap_or_else(|_| "{}".into())
        );
    }

    args.push(Box::new(team.to_string()));
    let team_idx = args.len();
    args.push(Box::new(task_id));
    let id_idx = args.len();

    let sql = format!(
        "UPDATE tasks SET {} WHERE team = ?{team_idx} AND id = ?{id_idx}",
        sets.join(", ")
    );
    let params_ref: Vec<&dyn rusqlite::types::ToSql> = args.iter().map(|b| b.as_ref()).collect();
    let changed = conn
        .execute(&sql, params_ref.as_slice())
        .map_err(|e| DelegateError::Database(format!("update_task: {e}")))?;
    if changed == 0 {
        return Err(DelegateError::NotFound(format!(
            "task {}",
            format_task_id(task_id)
        )));
    }
    Ok(())
}

/// Validate and apply a status transition, stamping `completed_at` on
/// terminal statuses. Entering `in_approval` bumps `review_attempt`
/// and ensures a review row for the new attempt.
pub fn change_status(
    conn: &Connection,
    workflows: &WorkflowRegistry,
    team: &str,
    task_id: i64,
    new_status: TaskStatus,
) -> Result<()> {
    transition(conn, workflows, team, task_id, new_status, None)
}

/// Atomically reassign and change status. Used by the merge worker when
/// the manager takes ownership of an escalating task.
pub fn transition_task(
    conn: &Connection,
    workflows: &WorkflowRegistry,
    team: &str,
    task_id: i64,
    new_status: TaskStatus,
    assignee: &str,
) -> Result<()> {
    transition(conn, workflows, team, task_id, new_status, Some(assignee))
}

fn transition(
    conn: &Connection,
    workflows: &WorkflowRegistry,
    team: &str,
    task_id: i64,
    new_status: TaskStatus,
    assignee: Option<&str>,
) -> Result<()> {
    let task = get_task(conn, team, task_id)?;
    let workflow = workflows.get(&task.workflow, task.workflow_version);
    if !workflow.allows(task.status.as_str(), new_status.as_str()) {
        return Err(DelegateError::Validation(format!(
            "illegal transition for {}: {} -> {}",
            task.display_id(),
            task.status,
            new_status
        )));
    }

    let now = now_ts();
    let completed_at = if new_status.is_terminal() {
        now.clone()
    } else {
        String::new()
    };
    match assignee {
        Some(assignee) => {
            conn.execute(
                "UPDATE tasks SET status = ?1, assignee = ?2, updated_at = ?3, completed_at = ?4
                 WHERE team = ?5 AND id = ?6",
                params![new_status.as_str(), assignee, now, completed_at, team, task_id],
            )
            .map_err(|e| DelegateError::Database(format!("transition_task: {e}")))?;
        }
        None => {
            conn.execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2, completed_at = ?3
                 WHERE team = ?4 AND id = ?5",
                params![new_status.as_str(), now, completed_at, team, task_id],
            )
            .map_err(|e| DelegateError::Database(format!("change_status: {e}")))?;
        }
    }

    if new_status == TaskStatus::InApproval {
        let attempt = task.review_attempt + 1;
        conn.execute(
            "UPDATE tasks SET review_attempt = ?1 WHERE team = ?2 AND id = ?3",
            params![attempt, team, task_id],
        )
        .map_err(|e| DelegateError::Database(format!("review_attempt: {e}")))?;
        reviews::ensure_review(conn, team, task_id, attempt)?;
    }

    tracing::debug!(
        "{}: {} -> {}",
        format_task_id(task_id),
        task.status,
        new_status
    );
    Ok(())
}

/// True iff every dependency is `done` or `cancelled`. Gates worktree
/// creation in the daemon.
pub fn all_deps_resolved(conn: &Connection, team: &str, task: &Task) -> Result<bool> {
    for dep_id in &task.depends_on {
        match get_task(conn, team, *dep_id) {
            Ok(dep) => {
                if !matches!(dep.status, TaskStatus::Done | TaskStatus::Cancelled) {
                    return Ok(false);
                }
            }
            // A dangling dependency id never resolves.
            Err(DelegateError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

// ── Comments and timeline ──────────────────────────────────────────

pub fn add_comment(
    conn: &Connection,
    ids: &IdRegistry,
    team: &str,
    task_id: i64,
    author: &str,
    body: &str,
) -> Result<i64> {
    let team_uuid = ids.resolve_team(conn, team).unwrap_or_default();
    let author_uuid = if team_uuid.is_empty() {
        String::new()
    } else {
        ids.resolve_member_flexible(conn, &team_uuid, author)
            .unwrap_or_default()
    };
    conn.execute(
        "INSERT INTO task_comments (task_id, author, body, created_at, team, team_uuid, author_uuid)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![task_id, author, body, now_ts(), team, team_uuid, author_uuid],
    )
    .map_err(|e| DelegateError::Database(format!("add_comment: {e}")))?;
    Ok(conn.last_insert_rowid())
}

pub fn get_comments(conn: &Connection, team: &str, task_id: i64) -> Result<Vec<TaskComment>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, task_id, author, body, created_at FROM task_comments
             WHERE team = ?1 AND task_id = ?2 ORDER BY created_at ASC, id ASC",
        )
        .map_err(|e| DelegateError::Database(format!("get_comments: {e}")))?;
    let rows = stmt
        .query_map(params![team, task_id], |row| {
            Ok(TaskComment {
                id: row.get(0)?,
                task_id: row.get(1)?,
                author: row.get(2)?,
                body: row.get(3)?,
                created_at: row.get(4)?,
            })
        })
        .map_err(|e| DelegateError::Database(format!("get_comments: {e}")))?;
    let mut comments = Vec::new();
    for row in rows {
        comments.push(row.map_err(|e| DelegateError::Database(format!("row: {e}")))?);
    }
    Ok(comments)
}

/// One entry in a task's interleaved activity timeline.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineEntry {
    Comment {
        author: String,
        body: String,
        at: String,
    },
    Event {
        content: String,
        at: String,
    },
}

impl TimelineEntry {
    fn at(&self) -> &str {
        match self {
            Self::Comment { at, .. } => at,
            Self::Event { at, .. } => at,
        }
    }
}

/// Comments and event messages for a task, interleaved by time, most
/// recent `limit` entries.
pub fn get_task_timeline(
    conn: &Connection,
    team: &str,
    task_id: i64,
    limit: usize,
) -> Result<Vec<TimelineEntry>> {
    let mut entries: Vec<TimelineEntry> = get_comments(conn, team, task_id)?
        .into_iter()
        .map(|c| TimelineEntry::Comment {
            author: c.author,
            body: c.body,
            at: c.created_at,
        })
        .collect();

    let mut stmt = conn
        .prepare(
            "SELECT content, timestamp FROM messages
             WHERE team = ?1 AND task_id = ?2 AND type = 'event'
             ORDER BY timestamp ASC",
        )
        .map_err(|e| DelegateError::Database(format!("timeline: {e}")))?;
    let rows = stmt
        .query_map(params![team, task_id], |row| {
            Ok(TimelineEntry::Event {
                content: row.get(0)?,
                at: row.get(1)?,
            })
        })
        .map_err(|e| DelegateError::Database(format!("timeline: {e}")))?;
    for row in rows {
        entries.push(row.map_err(|e| DelegateError::Database(format!("row: {e}")))?);
    }

    entries.sort_by(|a, b| a.at().cmp(b.at()));
    if entries.len() > limit {
        entries.drain(..entries.len() - limit);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::log_event;
    use crate::testutil::test_db;
    use delegate_core::types::MemberKind;

    fn setup() -> (tempfile::TempDir, crate::Db, IdRegistry, WorkflowRegistry) {
        let (dir, db) = test_db();
        let ids = IdRegistry::new();
        {
            let conn = db.conn().unwrap();
            let team = ids.register_team(&conn, "alpha", None).unwrap();
            ids.register_member(&conn, MemberKind::Agent, Some(&team), "worker")
                .unwrap();
            ids.register_member(&conn, MemberKind::Agent, Some(&team), "lead")
                .unwrap();
        }
        (dir, db, ids, WorkflowRegistry::new())
    }

    fn advance(
        conn: &Connection,
        wf: &WorkflowRegistry,
        team: &str,
        id: i64,
        path: &[TaskStatus],
    ) {
        for status in path {
            change_status(conn, wf, team, id, *status).unwrap();
        }
    }

    #[test]
    fn test_create_task_derives_branch() {
        let (_dir, db, ids, _wf) = setup();
        let conn = db.conn().unwrap();
        let task = create_task(
            &conn,
            &ids,
            "alpha",
            NewTask {
                title: "Add feature".into(),
                repos: vec!["app".into()],
                dri: "worker".into(),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(
            task.branch,
            format!("delegate/{}/alpha/T{:04}", &task.team_uuid[..6], task.id)
        );
        assert_eq!(task.dri_uuid.len(), 32);
    }

    #[test]
    fn test_create_task_without_repos_has_no_branch() {
        let (_dir, db, ids, _wf) = setup();
        let conn = db.conn().unwrap();
        let task = create_task(
            &conn,
            &ids,
            "alpha",
            NewTask {
                title: "Chore".into(),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(task.branch.is_empty());
    }

    #[test]
    fn test_change_status_validates() {
        let (_dir, db, ids, wf) = setup();
        let conn = db.conn().unwrap();
        let task = create_task(
            &conn,
            &ids,
            "alpha",
            NewTask {
                title: "T".into(),
                ..Default::default()
            },
        )
        .unwrap();

        let err = change_status(&conn, &wf, "alpha", task.id, TaskStatus::Done).unwrap_err();
        assert!(matches!(err, DelegateError::Validation(_)));

        change_status(&conn, &wf, "alpha", task.id, TaskStatus::InProgress).unwrap();
        assert_eq!(
            get_task(&conn, "alpha", task.id).unwrap().status,
            TaskStatus::InProgress
        );
    }

    #[test]
    fn test_completed_at_stamped_on_terminal() {
        let (_dir, db, ids, wf) = setup();
        let conn = db.conn().unwrap();
        let task = create_task(
            &conn,
            &ids,
            "alpha",
            NewTask {
                title: "T".into(),
                ..Default::default()
            },
        )
        .unwrap();
        advance(
            &conn,
            &wf,
            "alpha",
            task.id,
            &[
                TaskStatus::InProgress,
                TaskStatus::InReview,
                TaskStatus::InApproval,
                TaskStatus::Merging,
                TaskStatus::Done,
            ],
        );
        let done = get_task(&conn, "alpha", task.id).unwrap();
        assert!(!done.completed_at.is_empty());
        assert!(done.completed_at >= done.created_at);
    }

    #[test]
    fn test_in_approval_creates_review_row() {
        let (_dir, db, ids, wf) = setup();
        let conn = db.conn().unwrap();
        let task = create_task(
            &conn,
            &ids,
            "alpha",
            NewTask {
                title: "T".into(),
                ..Default::default()
            },
        )
        .unwrap();
        advance(
            &conn,
            &wf,
            "alpha",
            task.id,
            &[
                TaskStatus::InProgress,
                TaskStatus::InReview,
                TaskStatus::InApproval,
            ],
        );
        let task = get_task(&conn, "alpha", task.id).unwrap();
        assert_eq!(task.review_attempt, 1);
        let review = reviews::get_current_review(&conn, "alpha", task.id)
            .unwrap()
            .unwrap();
        assert_eq!(review.attempt, 1);
        assert!(review.verdict.is_none());

        // Rejected and back: a second attempt gets its own row.
        advance(
            &conn,
            &wf,
            "alpha",
            task.id,
            &[
                TaskStatus::Rejected,
                TaskStatus::InProgress,
                TaskStatus::InReview,
                TaskStatus::InApproval,
            ],
        );
        let task = get_task(&conn, "alpha", task.id).unwrap();
        assert_eq!(task.review_attempt, 2);
        let review = reviews::get_current_review(&conn, "alpha", task.id)
            .unwrap()
            .unwrap();
        assert_eq!(review.attempt, 2);
    }

    #[test]
    fn test_transition_task_reassigns_atomically() {
        let (_dir, db, ids, wf) = setup();
        let conn = db.conn().unwrap();
        let task = create_task(
            &conn,
            &ids,
            "alpha",
            NewTask {
                title: "T".into(),
                assignee: "worker".into(),
                ..Default::default()
            },
        )
        .unwrap();
        advance(
            &conn,
            &wf,
            "alpha",
            task.id,
            &[
                TaskStatus::InProgress,
                TaskStatus::InReview,
                TaskStatus::InApproval,
            ],
        );
        transition_task(&conn, &wf, "alpha", task.id, TaskStatus::Merging, "lead").unwrap();
        let task = get_task(&conn, "alpha", task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Merging);
        assert_eq!(task.assignee, "lead");
    }

    #[test]
    fn test_update_task_json_columns() {
        let (_dir, db, ids, _wf) = setup();
        let conn = db.conn().unwrap();
        let task = create_task(
            &conn,
            &ids,
            "alpha",
            NewTask {
                title: "T".into(),
                repos: vec!["app".into()],
                ..Default::default()
            },
        )
        .unwrap();

        let mut base = BTreeMap::new();
        base.insert("app".to_string(), "abc123".to_string());
        update_task(
            &conn,
            "alpha",
            task.id,
            TaskPatch {
                base_sha: Some(base),
                status_detail: Some("main has uncommitted changes".into()),
                merge_attempts: Some(2),
                retry_after: Some(Some(123.5)),
                ..Default::default()
            },
        )
        .unwrap();

        let task = get_task(&conn, "alpha", task.id).unwrap();
        assert_eq!(task.base_sha["app"], "abc123");
        assert_eq!(task.merge_attempts, 2);
        assert_eq!(task.retry_after, Some(123.5));

        // Clearing retry_after writes NULL.
        update_task(
            &conn,
            "alpha",
            task.id,
            TaskPatch {
                retry_after: Some(None),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(get_task(&conn, "alpha", task.id).unwrap().retry_after, None);
    }

    #[test]
    fn test_legacy_json_shapes_tolerated() {
        let (_dir, db, ids, _wf) = setup();
        let conn = db.conn().unwrap();
        let task = create_task(
            &conn,
            &ids,
            "alpha",
            NewTask {
                title: "T".into(),
                ..Default::default()
            },
        )
        .unwrap();
        // Simulate a legacy row: plain-string repo, bare SHA base_sha,
        // flat-list commits.
        conn.execute(
            "UPDATE tasks SET repo = 'oldrepo', base_sha = 'cafebabe', commits = '[\"s1\",\"s2\"]'
             WHERE id = ?1",
            params![task.id],
        )
        .unwrap();
        let task = get_task(&conn, "alpha", task.id).unwrap();
        assert_eq!(task.repos, vec!["oldrepo"]);
        assert_eq!(task.base_sha["oldrepo"], "cafebabe");
        assert_eq!(task.commits["oldrepo"], vec!["s1", "s2"]);
    }

    #[test]
    fn test_all_deps_resolved() {
        let (_dir, db, ids, wf) = setup();
        let conn = db.conn().unwrap();
        let dep = create_task(
            &conn,
            &ids,
            "alpha",
            NewTask {
                title: "dep".into(),
                ..Default::default()
            },
        )
        .unwrap();
        let task = create_task(
            &conn,
            &ids,
            "alpha",
            NewTask {
                title: "blocked".into(),
                depends_on: vec![dep.id],
                ..Default::default()
            },
        )
        .unwrap();

        let task = get_task(&conn, "alpha", task.id).unwrap();
        assert!(!all_deps_resolved(&conn, "alpha", &task).unwrap());

        advance(
            &conn,
            &wf,
            "alpha",
            dep.id,
            &[TaskStatus::InProgress, TaskStatus::Cancelled],
        );
        assert!(all_deps_resolved(&conn, "alpha", &task).unwrap());
    }

    #[test]
    fn test_timeline_interleaves_comments_and_events() {
        let (_dir, db, ids, _wf) = setup();
        let conn = db.conn().unwrap();
        let task = create_task(
            &conn,
            &ids,
            "alpha",
            NewTask {
                title: "T".into(),
                ..Default::default()
            },
        )
        .unwrap();
        add_comment(&conn, &ids, "alpha", task.id, "worker", "looking at it").unwrap();
        log_event(&conn, &ids, "alpha", "T0001 merge started", Some(task.id)).unwrap();
        add_comment(&conn, &ids, "alpha", task.id, "lead", "lgtm").unwrap();

        let timeline = get_task_timeline(&conn, "alpha", task.id, 10).unwrap();
        assert_eq!(timeline.len(), 3);
        let timeline = get_task_timeline(&conn, "alpha", task.id, 2).unwrap();
        assert_eq!(timeline.len(), 2);
    }

    #[test]
    fn test_list_tasks_filters() {
        let (_dir, db, ids, wf) = setup();
        let conn = db.conn().unwrap();
        let a = create_task(
            &conn,
            &ids,
            "alpha",
            NewTask {
                title: "a".into(),
                assignee: "worker".into(),
                ..Default::default()
            },
        )
        .unwrap();
        create_task(
            &conn,
            &ids,
            "alpha",
            NewTask {
                title: "b".into(),
                assignee: "lead".into(),
                ..Default::default()
            },
        )
        .unwrap();
        change_status(&conn, &wf, "alpha", a.id, TaskStatus::InProgress).unwrap();

        let in_progress = list_tasks(
            &conn,
            "alpha",
            TaskFilter {
                status: Some(TaskStatus::InProgress),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(in_progress.len(), 1);
        assert_eq!(in_progress[0].title, "a");

        let by_assignee = list_tasks(
            &conn,
            "alpha",
            TaskFilter {
                assignee: Some("lead"),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(by_assignee.len(), 1);
        assert_eq!(by_assignee[0].title, "b");
    }
}
