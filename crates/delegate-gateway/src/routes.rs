//! JSON route handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use delegate_db::rusqlite::params;
use serde::Deserialize;

use delegate_core::config::{self, AgentState};
use delegate_core::error::DelegateError;
use delegate_core::types::{TaskStatus, Verdict};
use delegate_db::tasks::{self, TaskFilter, TaskPatch};
use delegate_db::{mailbox, reviews};
use delegate_runtime::turn::list_ai_agents;

use crate::server::{ApiError, ApiResult, AppState};

/// Active team names with their UUIDs.
fn active_teams(state: &AppState) -> ApiResult<Vec<(String, String)>> {
    let conn = state.db.conn()?;
    let mut stmt = conn
        .prepare("SELECT name, uuid FROM team_ids WHERE deleted = 0 ORDER BY name")
        .map_err(|e| ApiError(DelegateError::Database(e.to_string())))?;
    let rows = stmt
        .query_map(params![], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| ApiError(DelegateError::Database(e.to_string())))?;
    let mut teams = Vec::new();
    for row in rows {
        teams.push(row.map_err(|e| ApiError(DelegateError::Database(e.to_string())))?);
    }
    Ok(teams)
}

fn team_uuid(state: &AppState, team: &str) -> ApiResult<String> {
    let conn = state.db.conn()?;
    Ok(state.ids.resolve_team(&conn, team)?)
}

fn agents_payload(state: &AppState, team_uuid: &str) -> Vec<serde_json::Value> {
    list_ai_agents(&state.home, team_uuid)
        .into_iter()
        .map(|name| {
            let agent_state = AgentState::load(&state.home.agent_state_path(team_uuid, &name))
                .unwrap_or_default();
            serde_json::json!({
                "name": name,
                "role": agent_state.role(),
                "model": agent_state.effective_model(),
            })
        })
        .collect()
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "delegate",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
pub struct BootstrapQuery {
    pub team: Option<String>,
}

/// One request yields config + team list + the initial team's data.
pub async fn bootstrap(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BootstrapQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let teams = active_teams(&state)?;
    let initial_team = query
        .team
        .or_else(|| teams.first().map(|(name, _)| name.clone()));

    let initial_data = match &initial_team {
        Some(team) => {
            let uuid = team_uuid(&state, team)?;
            let conn = state.db.conn()?;
            let tasks = tasks::list_tasks(&conn, team, TaskFilter::default())?;
            let messages = recent_messages(&state, team, 50, None)?;
            serde_json::json!({
                "tasks": tasks,
                "agents": agents_payload(&state, &uuid),
                "messages": messages,
            })
        }
        None => serde_json::json!({}),
    };

    let cfg = config::GlobalConfig::load(&state.home)?;
    Ok(Json(serde_json::json!({
        "config": { "default_human": cfg.default_human, "interval_secs": cfg.interval_secs },
        "teams": teams.iter().map(|(name, _)| name).collect::<Vec<_>>(),
        "initial_team": initial_team,
        "initial_data": initial_data,
    })))
}

pub async fn list_teams(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let teams: Vec<serde_json::Value> = active_teams(&state)?
        .into_iter()
        .map(|(name, uuid)| serde_json::json!({ "name": name, "uuid": uuid }))
        .collect();
    Ok(Json(serde_json::json!({ "teams": teams })))
}

pub async fn team_tasks(
    State(state): State<Arc<AppState>>,
    Path(team): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    team_uuid(&state, &team)?; // 404 on unknown team
    let conn = state.db.conn()?;
    let tasks = tasks::list_tasks(&conn, &team, TaskFilter::default())?;
    Ok(Json(serde_json::json!({ "tasks": tasks })))
}

#[derive(Deserialize, Default)]
pub struct MessagesQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub since: Option<String>,
}

fn recent_messages(
    state: &AppState,
    team: &str,
    limit: usize,
    since: Option<&str>,
) -> ApiResult<Vec<delegate_core::types::Message>> {
    let conn = state.db.conn()?;
    let mut stmt = conn
        .prepare(
            "SELECT id, timestamp, sender, recipient, content, type, task_id,
                    delivered_at, seen_at, processed_at, result, team, team_uuid,
                    sender_uuid, recipient_uuid
             FROM messages
             WHERE team = ?1 AND type = 'chat' AND timestamp > COALESCE(?2, '')
             ORDER BY id DESC LIMIT ?3",
        )
        .map_err(|e| ApiError(DelegateError::Database(e.to_string())))?;
    let rows = stmt
        .query_map(params![team, since, limit as i64], |row| {
            let type_str: String = row.get(5)?;
            Ok(delegate_core::types::Message {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                sender: row.get(2)?,
                recipient: row.get(3)?,
                content: row.get(4)?,
                msg_type: delegate_core::types::MessageType::parse(&type_str)
                    .unwrap_or(delegate_core::types::MessageType::Chat),
                task_id: row.get(6)?,
                delivered_at: row.get(7)?,
                seen_at: row.get(8)?,
                processed_at: row.get(9)?,
                result: row.get(10)?,
                team: row.get(11)?,
                team_uuid: row.get(12)?,
                sender_uuid: row.get(13)?,
                recipient_uuid: row.get(14)?,
            })
        })
        .map_err(|e| ApiError(DelegateError::Database(e.to_string())))?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row.map_err(|e| ApiError(DelegateError::Database(e.to_string())))?);
    }
    messages.reverse();
    Ok(messages)
}

pub async fn team_messages(
    State(state): State<Arc<AppState>>,
    Path(team): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    team_uuid(&state, &team)?;
    let limit = query.limit.unwrap_or(50).min(500);
    let messages = recent_messages(&state, &team, limit, query.since.as_deref())?;
    Ok(Json(serde_json::json!({ "messages": messages })))
}

#[derive(Deserialize)]
pub struct SendMessageBody {
    pub recipient: String,
    pub content: String,
}

/// Human sends chat to an AI agent on the team.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(team): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.content.trim().is_empty() {
        return Err(ApiError(DelegateError::Validation(
            "message content is empty".into(),
        )));
    }
    let uuid = team_uuid(&state, &team)?;
    let agents = list_ai_agents(&state.home, &uuid);
    if !agents.contains(&body.recipient) {
        return Err(ApiError(DelegateError::Validation(format!(
            "recipient '{}' is not an AI agent on team '{team}'",
            body.recipient
        ))));
    }

    let sender = config::default_human(&state.home).unwrap_or_else(|| "human".to_string());
    let conn = state.db.conn()?;
    let id = mailbox::send(
        &conn,
        &state.ids,
        &team,
        &sender,
        &body.recipient,
        &body.content,
        None,
    )?;
    Ok(Json(serde_json::json!({ "id": id })))
}

// ── Task lifecycle (legacy /api/ routes aggregate across teams) ────

fn find_task(state: &AppState, task_id: i64) -> ApiResult<delegate_core::types::Task> {
    let conn = state.db.conn()?;
    Ok(tasks::find_task(&conn, task_id)?)
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let task = find_task(&state, id)?;
    Ok(Json(serde_json::to_value(&task).unwrap_or_default()))
}

#[derive(Deserialize, Default)]
pub struct VerdictBody {
    #[serde(default)]
    pub reviewer: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

pub async fn approve_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    body: Option<Json<VerdictBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    let task = find_task(&state, id)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let reviewer = body
        .reviewer
        .or_else(|| config::default_human(&state.home))
        .unwrap_or_else(|| "human".to_string());

    let conn = state.db.conn()?;
    match task.status {
        TaskStatus::InReview => {
            tasks::change_status(&conn, &state.workflows, &task.team, id, TaskStatus::InApproval)?;
        }
        TaskStatus::InApproval => {}
        other => {
            return Err(ApiError(DelegateError::Validation(format!(
                "task {} cannot be approved from status {other}",
                task.display_id()
            ))))
        }
    }
    reviews::set_verdict(
        &conn,
        &state.ids,
        &task.team,
        id,
        Verdict::Approved,
        body.summary.as_deref().unwrap_or(""),
        &reviewer,
    )?;
    Ok(Json(serde_json::json!({ "status": "approved" })))
}

pub async fn reject_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    body: Option<Json<VerdictBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    let task = find_task(&state, id)?;
    if !matches!(task.status, TaskStatus::InReview | TaskStatus::InApproval) {
        return Err(ApiError(DelegateError::Validation(format!(
            "task {} cannot be rejected from status {}",
            task.display_id(),
            task.status
        ))));
    }
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let reviewer = body
        .reviewer
        .or_else(|| config::default_human(&state.home))
        .unwrap_or_else(|| "human".to_string());

    let conn = state.db.conn()?;
    if task.status == TaskStatus::InApproval {
        reviews::set_verdict(
            &conn,
            &state.ids,
            &task.team,
            id,
            Verdict::Rejected,
            body.summary.as_deref().unwrap_or(""),
            &reviewer,
        )?;
    }
    tasks::change_status(&conn, &state.workflows, &task.team, id, TaskStatus::Rejected)?;
    Ok(Json(serde_json::json!({ "status": "rejected" })))
}

pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let task = find_task(&state, id)?;
    let uuid = team_uuid(&state, &task.team)?;
    delegate_git::cancel_task(
        &state.db,
        &state.ids,
        &state.workflows,
        &state.home,
        &task.team,
        &uuid,
        id,
    )
    .await?;
    Ok(Json(serde_json::json!({ "status": "cancelled" })))
}

pub async fn retry_merge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let task = find_task(&state, id)?;
    if task.status != TaskStatus::MergeFailed {
        return Err(ApiError(DelegateError::Validation(format!(
            "task {} is not in merge_failed",
            task.display_id()
        ))));
    }
    let conn = state.db.conn()?;
    tasks::update_task(
        &conn,
        &task.team,
        id,
        TaskPatch {
            merge_attempts: Some(0),
            retry_after: Some(None),
            status_detail: Some(String::new()),
            ..Default::default()
        },
    )?;
    tasks::transition_task(
        &conn,
        &state.workflows,
        &task.team,
        id,
        TaskStatus::Merging,
        &task.assignee,
    )?;
    Ok(Json(serde_json::json!({ "status": "merging" })))
}

pub async fn task_reviews(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let task = find_task(&state, id)?;
    let conn = state.db.conn()?;
    let reviews = reviews::list_reviews(&conn, &task.team, id)?;
    Ok(Json(serde_json::json!({ "reviews": reviews })))
}

pub async fn current_review(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let task = find_task(&state, id)?;
    let conn = state.db.conn()?;
    let review = reviews::get_current_review(&conn, &task.team, id)?;
    Ok(Json(serde_json::json!({ "review": review })))
}
