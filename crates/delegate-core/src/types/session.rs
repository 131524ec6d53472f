//! Session model — one row per turn-runtime invocation.

use serde::{Deserialize, Serialize};

/// A row in `sessions`: telemetry for one agent turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub agent: String,
    pub task_id: Option<i64>,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub duration_seconds: f64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub cost_usd: f64,
    pub team: String,
    pub team_uuid: String,
    pub agent_uuid: String,
}
