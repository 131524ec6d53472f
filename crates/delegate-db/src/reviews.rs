//! Reviews — one row per `(task_id, attempt)` — and review comments.

use rusqlite::{params, Connection, OptionalExtension};

use delegate_core::error::{DelegateError, Result};
use delegate_core::types::{Review, ReviewComment, Verdict};

use crate::ids::IdRegistry;
use crate::now_ts;

fn review_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Review> {
    let verdict: Option<String> = row.get(3)?;
    Ok(Review {
        id: row.get(0)?,
        task_id: row.get(1)?,
        attempt: row.get(2)?,
        verdict: verdict.as_deref().and_then(Verdict::parse),
        summary: row.get(4)?,
        reviewer: row.get(5)?,
        created_at: row.get(6)?,
        decided_at: row.get(7)?,
        team_uuid: row.get(8)?,
        reviewer_uuid: row.get(9)?,
    })
}

const REVIEW_COLUMNS: &str =
    "id, task_id, attempt, verdict, summary, reviewer, created_at, decided_at, team_uuid, reviewer_uuid";

/// Create the review row for an attempt if it does not exist yet.
/// Called when a task enters `in_approval`.
pub fn ensure_review(conn: &Connection, team: &str, task_id: i64, attempt: i64) -> Result<()> {
    let team_uuid: String = conn
        .query_row(
            "SELECT team_uuid FROM tasks WHERE team = ?1 AND id = ?2",
            params![team, task_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| DelegateError::Database(format!("ensure_review: {e}")))?
        .unwrap_or_default();
    conn.execute(
        "INSERT OR IGNORE INTO reviews (task_id, attempt, created_at, team, team_uuid)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![task_id, attempt, now_ts(), team, team_uuid],
    )
    .map_err(|e| DelegateError::Database(format!("ensure_review: {e}")))?;
    Ok(())
}

/// The review for the task's current `review_attempt`, if any.
pub fn get_current_review(conn: &Connection, team: &str, task_id: i64) -> Result<Option<Review>> {
    let attempt: Option<i64> = conn
        .query_row(
            "SELECT review_attempt FROM tasks WHERE team = ?1 AND id = ?2",
            params![team, task_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| DelegateError::Database(format!("get_current_review: {e}")))?;
    let Some(attempt) = attempt else {
        return Ok(None);
    };
    get_review(conn, team, task_id, attempt)
}

pub fn get_review(
    conn: &Connection,
    team: &str,
    task_id: i64,
    attempt: i64,
) -> Result<Option<Review>> {
    let sql = format!(
        "SELECT {REVIEW_COLUMNS} FROM reviews WHERE team = ?1 AND task_id = ?2 AND attempt = ?3"
    );
    conn.query_row(&sql, params![team, task_id, attempt], review_from_row)
        .optional()
        .map_err(|e| DelegateError::Database(format!("get_review: {e}")))
}

pub fn list_reviews(conn: &Connection, team: &str, task_id: i64) -> Result<Vec<Review>> {
    let sql = format!(
        "SELECT {REVIEW_COLUMNS} FROM reviews WHERE team = ?1 AND task_id = ?2 ORDER BY attempt ASC"
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| DelegateError::Database(format!("list_reviews: {e}")))?;
    let rows = stmt
        .query_map(params![team, task_id], review_from_row)
        .map_err(|e| DelegateError::Database(format!("list_reviews: {e}")))?;
    let mut reviews = Vec::new();
    for row in rows {
        reviews.push(row.map_err(|e| DelegateError::Database(format!("row: {e}")))?);
    }
    Ok(reviews)
}

/// Record the reviewer's verdict on the current attempt.
pub fn set_verdict(
    conn: &Connection,
    ids: &IdRegistry,
    team: &str,
    task_id: i64,
    verdict: Verdict,
    summary: &str,
    reviewer: &str,
) -> Result<()> {
    let attempt: i64 = conn
        .query_row(
            "SELECT review_attempt FROM tasks WHERE team = ?1 AND id = ?2",
            params![team, task_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| DelegateError::Database(format!("set_verdict: {e}")))?
        .ok_or_else(|| DelegateError::NotFound(format!("task {task_id}")))?;
    ensure_review(conn, team, task_id, attempt)?;

    let team_uuid: String = conn
        .query_row(
            "SELECT team_uuid FROM tasks WHERE team = ?1 AND id = ?2",
            params![team, task_id],
            |row| row.get(0),
        )
        .unwrap_or_default();
    let reviewer_uuid = if team_uuid.is_empty() {
        String::new()
    } else {
        ids.resolve_member_flexible(conn, &team_uuid, reviewer)
            .unwrap_or_default()
    };

    conn.execute(
        "UPDATE reviews SET verdict = ?1, summary = ?2, reviewer = ?3,
                reviewer_uuid = ?4, decided_at = ?5
         WHERE team = ?6 AND task_id = ?7 AND attempt = ?8",
        params![
            verdict.as_str(),
            summary,
            reviewer,
            reviewer_uuid,
            now_ts(),
            team,
            task_id,
            attempt
        ],
    )
    .map_err(|e| DelegateError::Database(format!("set_verdict: {e}")))?;
    Ok(())
}

// ── Review comments ────────────────────────────────────────────────

pub fn add_review_comment(
    conn: &Connection,
    ids: &IdRegistry,
    team: &str,
    task_id: i64,
    attempt: i64,
    file: &str,
    line: Option<i64>,
    body: &str,
    author: &str,
) -> Result<i64> {
    let team_uuid: String = conn
        .query_row(
            "SELECT team_uuid FROM tasks WHERE team = ?1 AND id = ?2",
            params![team, task_id],
            |row| row.get(0),
        )
        .unwrap_or_default();
    let author_uuid = if team_uuid.is_empty() {
        String::new()
    } else {
        ids.resolve_member_flexible(conn, &team_uuid, author)
            .unwrap_or_default()
    };
    conn.execute(
        "INSERT INTO review_comments
            (task_id, attempt, file, line, body, author, created_at, team, team_uuid, author_uuid)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![task_id, attempt, file, line, body, author, now_ts(), team, team_uuid, author_uuid],
    )
    .map_err(|e| DelegateError::Database(format!("add_review_comment: {e}")))?;
    Ok(conn.last_insert_rowid())
}

pub fn list_review_comments(
    conn: &Connection,
    team: &str,
    task_id: i64,
    attempt: i64,
) -> Result<Vec<ReviewComment>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, task_id, attempt, file, line, body, author, created_at
             FROM review_comments
             WHERE team = ?1 AND task_id = ?2 AND attempt = ?3
             ORDER BY id ASC",
        )
        .map_err(|e| DelegateError::Database(format!("list_review_comments: {e}")))?;
    let rows = stmt
        .query_map(params![team, task_id, attempt], |row| {
            Ok(ReviewComment {
                id: row.get(0)?,
                task_id: row.get(1)?,
                attempt: row.get(2)?,
                file: row.get(3)?,
                line: row.get(4)?,
                body: row.get(5)?,
                author: row.get(6)?,
                created_at: row.get(7)?,
            })
        })
        .map_err(|e| DelegateError::Database(format!("list_review_comments: {e}")))?;
    let mut comments = Vec::new();
    for row in rows {
        comments.push(row.map_err(|e| DelegateError::Database(format!("row: {e}")))?);
    }
    Ok(comments)
}

pub fn update_review_comment(
    conn: &Connection,
    team: &str,
    comment_id: i64,
    body: &str,
) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE review_comments SET body = ?1 WHERE team = ?2 AND id = ?3",
            params![body, team, comment_id],
        )
        .map_err(|e| DelegateError::Database(format!("update_review_comment: {e}")))?;
    if changed == 0 {
        return Err(DelegateError::NotFound(format!(
            "review comment {comment_id}"
        )));
    }
    Ok(())
}

pub fn delete_review_comment(conn: &Connection, team: &str, comment_id: i64) -> Result<()> {
    let changed = conn
        .execute(
            "DELETE FROM review_comments WHERE team = ?1 AND id = ?2",
            params![team, comment_id],
        )
        .map_err(|e| DelegateError::Database(format!("delete_review_comment: {e}")))?;
    if changed == 0 {
        return Err(DelegateError::NotFound(format!(
            "review comment {comment_id}"
        )));
    }
    Ok(())
}
