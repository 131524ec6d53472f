//! Session telemetry — one row per turn-runtime invocation.

use rusqlite::{params, Connection, OptionalExtension};

use delegate_core::error::{DelegateError, Result};
use delegate_core::types::Session;

use crate::ids::IdRegistry;
use crate::now_ts;

/// Token/cost numbers written back onto a session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionTokens {
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub cost_usd: f64,
}

/// Open a session row for a turn. Returns the session id.
pub fn start_session(
    conn: &Connection,
    ids: &IdRegistry,
    team: &str,
    agent: &str,
    task_id: Option<i64>,
) -> Result<i64> {
    let team_uuid = ids.resolve_team(conn, team).unwrap_or_default();
    let agent_uuid = if team_uuid.is_empty() {
        String::new()
    } else {
        ids.resolve_member_flexible(conn, &team_uuid, agent)
            .unwrap_or_default()
    };
    conn.execute(
        "INSERT INTO sessions (agent, task_id, started_at, team, team_uuid, agent_uuid)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![agent, task_id, now_ts(), team, team_uuid, agent_uuid],
    )
    .map_err(|e| DelegateError::Database(format!("start_session: {e}")))?;
    Ok(conn.last_insert_rowid())
}

/// Close a session, writing final token counts and duration.
pub fn end_session(
    conn: &Connection,
    team: &str,
    session_id: i64,
    tokens: SessionTokens,
) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET
            ended_at = ?1,
            duration_seconds = (julianday(?1) - julianday(started_at)) * 86400.0,
            tokens_in = ?2, tokens_out = ?3,
            cache_read_tokens = ?4, cache_write_tokens = ?5, cost_usd = ?6
         WHERE team = ?7 AND id = ?8",
        params![
            now_ts(),
            tokens.tokens_in,
            tokens.tokens_out,
            tokens.cache_read_tokens,
            tokens.cache_write_tokens,
            tokens.cost_usd,
            team,
            session_id
        ],
    )
    .map_err(|e| DelegateError::Database(format!("end_session: {e}")))?;
    Ok(())
}

/// Update token counts mid-flight (before `end_session`).
pub fn update_session_tokens(
    conn: &Connection,
    team: &str,
    session_id: i64,
    tokens: SessionTokens,
) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET tokens_in = ?1, tokens_out = ?2,
            cache_read_tokens = ?3, cache_write_tokens = ?4, cost_usd = ?5
         WHERE team = ?6 AND id = ?7",
        params![
            tokens.tokens_in,
            tokens.tokens_out,
            tokens.cache_read_tokens,
            tokens.cache_write_tokens,
            tokens.cost_usd,
            team,
            session_id
        ],
    )
    .map_err(|e| DelegateError::Database(format!("update_session_tokens: {e}")))?;
    Ok(())
}

/// Re-associate a session with a task discovered after the batch was
/// selected (taskless batch, agent has an in-progress task).
pub fn update_session_task(
    conn: &Connection,
    team: &str,
    session_id: i64,
    task_id: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET task_id = ?1 WHERE team = ?2 AND id = ?3",
        params![task_id, team, session_id],
    )
    .map_err(|e| DelegateError::Database(format!("update_session_task: {e}")))?;
    Ok(())
}

pub fn get_session(conn: &Connection, team: &str, session_id: i64) -> Result<Option<Session>> {
    conn.query_row(
        "SELECT id, agent, task_id, started_at, ended_at, duration_seconds,
                tokens_in, tokens_out, cache_read_tokens, cache_write_tokens,
                cost_usd, team, team_uuid, agent_uuid
         FROM sessions WHERE team = ?1 AND id = ?2",
        params![team, session_id],
        |row| {
            Ok(Session {
                id: row.get(0)?,
                agent: row.get(1)?,
                task_id: row.get(2)?,
                started_at: row.get(3)?,
                ended_at: row.get(4)?,
                duration_seconds: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                tokens_in: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
                tokens_out: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
                cache_read_tokens: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
                cache_write_tokens: row.get::<_, Option<i64>>(9)?.unwrap_or(0),
                cost_usd: row.get::<_, Option<f64>>(10)?.unwrap_or(0.0),
                team: row.get(11)?,
                team_uuid: row.get(12)?,
                agent_uuid: row.get(13)?,
            })
        },
    )
    .optional()
    .map_err(|e| DelegateError::Database(format!("get_session: {e}")))
}
