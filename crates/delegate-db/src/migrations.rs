//! Versioned, transactional schema migrations with backup-on-upgrade.
//!
//! Migrations are an ordered list of SQL scripts. NEVER reorder or
//! modify a released entry; only append. Each pending migration runs in
//! a `BEGIN IMMEDIATE` transaction together with its `schema_meta`
//! version bump; a failure rolls the transaction back, restores the
//! pre-upgrade backup, and aborts. The UUID backfill runs after every
//! migration pass and is idempotent.

use std::path::Path;

use rusqlite::{params, Connection, TransactionBehavior};

use delegate_core::config::human_members;
use delegate_core::error::{DelegateError, Result};
use delegate_core::paths::Home;

/// Ordered migration scripts; index 0 is V1.
const MIGRATIONS: &[&str] = &[
    // --- V1: messages + sessions ---
    r#"
CREATE TABLE IF NOT EXISTS messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    sender      TEXT    NOT NULL,
    recipient   TEXT    NOT NULL,
    content     TEXT    NOT NULL,
    type        TEXT    NOT NULL CHECK(type IN ('chat', 'event'))
);

CREATE TABLE IF NOT EXISTS sessions (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    agent            TEXT    NOT NULL,
    task_id          INTEGER,
    started_at       TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    ended_at         TEXT,
    duration_seconds REAL    DEFAULT 0.0,
    tokens_in        INTEGER DEFAULT 0,
    tokens_out       INTEGER DEFAULT 0,
    cost_usd         REAL    DEFAULT 0.0
);

CREATE INDEX IF NOT EXISTS idx_messages_type ON messages(type);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_sender_recipient ON messages(sender, recipient);
CREATE INDEX IF NOT EXISTS idx_sessions_agent ON sessions(agent);
CREATE INDEX IF NOT EXISTS idx_sessions_task_id ON sessions(task_id);
"#,
    // --- V2: tasks table ---
    r#"
CREATE TABLE IF NOT EXISTS tasks (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    title            TEXT    NOT NULL,
    description      TEXT    NOT NULL DEFAULT '',
    status           TEXT    NOT NULL DEFAULT 'todo',
    dri              TEXT    NOT NULL DEFAULT '',
    assignee         TEXT    NOT NULL DEFAULT '',
    project          TEXT    NOT NULL DEFAULT '',
    priority         TEXT    NOT NULL DEFAULT 'medium',
    repo             TEXT    NOT NULL DEFAULT '',
    tags             TEXT    NOT NULL DEFAULT '[]',
    created_at       TEXT    NOT NULL,
    updated_at       TEXT    NOT NULL,
    completed_at     TEXT    NOT NULL DEFAULT '',
    depends_on       TEXT    NOT NULL DEFAULT '[]',
    branch           TEXT    NOT NULL DEFAULT '',
    base_sha         TEXT    NOT NULL DEFAULT '',
    commits          TEXT    NOT NULL DEFAULT '[]',
    rejection_reason TEXT    NOT NULL DEFAULT '',
    approval_status  TEXT    NOT NULL DEFAULT '',
    merge_base       TEXT    NOT NULL DEFAULT '',
    merge_tip        TEXT    NOT NULL DEFAULT '',
    attachments      TEXT    NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_assignee ON tasks(assignee);
CREATE INDEX IF NOT EXISTS idx_tasks_dri ON tasks(dri);
CREATE INDEX IF NOT EXISTS idx_tasks_repo ON tasks(repo);
CREATE INDEX IF NOT EXISTS idx_tasks_branch ON tasks(branch);
CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project);
"#,
    // --- V3: mailbox table ---
    r#"
CREATE TABLE IF NOT EXISTS mailbox (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    sender         TEXT    NOT NULL,
    recipient      TEXT    NOT NULL,
    body           TEXT    NOT NULL,
    created_at     TEXT    NOT NULL,
    delivered_at   TEXT,
    seen_at        TEXT,
    processed_at   TEXT
);

CREATE INDEX IF NOT EXISTS idx_mailbox_recipient_unread
    ON mailbox(recipient, delivered_at) WHERE processed_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_mailbox_sender ON mailbox(sender);
CREATE INDEX IF NOT EXISTS idx_mailbox_undelivered
    ON mailbox(id) WHERE delivered_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_mailbox_recipient_processed
    ON mailbox(recipient, processed_at) WHERE processed_at IS NOT NULL;
"#,
    // --- V4: task_id on mailbox + messages ---
    r#"
ALTER TABLE mailbox ADD COLUMN task_id INTEGER;
CREATE INDEX IF NOT EXISTS idx_mailbox_task_id ON mailbox(task_id);
ALTER TABLE messages ADD COLUMN task_id INTEGER;
CREATE INDEX IF NOT EXISTS idx_messages_task_id ON messages(task_id);
"#,
    // --- V5: reviews + review_comments, review_attempt on tasks ---
    r#"
ALTER TABLE tasks ADD COLUMN review_attempt INTEGER NOT NULL DEFAULT 0;

CREATE TABLE IF NOT EXISTS reviews (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id    INTEGER NOT NULL,
    attempt    INTEGER NOT NULL,
    verdict    TEXT,
    summary    TEXT    NOT NULL DEFAULT '',
    reviewer   TEXT    NOT NULL DEFAULT '',
    created_at TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    decided_at TEXT,
    UNIQUE(task_id, attempt)
);

CREATE INDEX IF NOT EXISTS idx_reviews_task_id ON reviews(task_id);

CREATE TABLE IF NOT EXISTS review_comments (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id    INTEGER NOT NULL,
    attempt    INTEGER NOT NULL,
    file       TEXT    NOT NULL,
    line       INTEGER,
    body       TEXT    NOT NULL,
    author     TEXT    NOT NULL,
    created_at TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_review_comments_task_attempt
    ON review_comments(task_id, attempt);
"#,
    // --- V6: cache token columns on sessions ---
    r#"
ALTER TABLE sessions ADD COLUMN cache_read_tokens INTEGER DEFAULT 0;
ALTER TABLE sessions ADD COLUMN cache_write_tokens INTEGER DEFAULT 0;
"#,
    // --- V7: merge failure tracking ---
    r#"
ALTER TABLE tasks ADD COLUMN status_detail TEXT NOT NULL DEFAULT '';
ALTER TABLE tasks ADD COLUMN merge_attempts INTEGER NOT NULL DEFAULT 0;
"#,
    // --- V8: task_comments table ---
    r#"
CREATE TABLE IF NOT EXISTS task_comments (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id    INTEGER NOT NULL,
    author     TEXT    NOT NULL,
    body       TEXT    NOT NULL,
    created_at TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_task_comments_task_id ON task_comments(task_id);
"#,
    // --- V9: merge mailbox into messages ---
    r#"
ALTER TABLE messages ADD COLUMN delivered_at TEXT;
ALTER TABLE messages ADD COLUMN seen_at TEXT;
ALTER TABLE messages ADD COLUMN processed_at TEXT;

UPDATE messages
SET delivered_at = (
    SELECT mb.delivered_at FROM mailbox mb
    WHERE mb.sender = messages.sender
      AND mb.recipient = messages.recipient
      AND mb.body = messages.content
      AND mb.task_id IS messages.task_id
    LIMIT 1
),
seen_at = (
    SELECT mb.seen_at FROM mailbox mb
    WHERE mb.sender = messages.sender
      AND mb.recipient = messages.recipient
      AND mb.body = messages.content
      AND mb.task_id IS messages.task_id
    LIMIT 1
),
processed_at = (
    SELECT mb.processed_at FROM mailbox mb
    WHERE mb.sender = messages.sender
      AND mb.recipient = messages.recipient
      AND mb.body = messages.content
      AND mb.task_id IS messages.task_id
    LIMIT 1
)
WHERE type = 'chat';

INSERT INTO messages (timestamp, sender, recipient, content, type, task_id, delivered_at, seen_at, processed_at)
SELECT mb.created_at, mb.sender, mb.recipient, mb.body, 'chat', mb.task_id, mb.delivered_at, mb.seen_at, mb.processed_at
FROM mailbox mb
WHERE NOT EXISTS (
    SELECT 1 FROM messages m
    WHERE m.sender = mb.sender
      AND m.recipient = mb.recipient
      AND m.content = mb.body
      AND m.task_id IS mb.task_id
);

CREATE INDEX IF NOT EXISTS idx_messages_recipient_unread
    ON messages(recipient, delivered_at)
    WHERE type = 'chat' AND processed_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_messages_sender
    ON messages(sender) WHERE type = 'chat';
CREATE INDEX IF NOT EXISTS idx_messages_undelivered
    ON messages(id) WHERE type = 'chat' AND delivered_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_messages_recipient_processed
    ON messages(recipient, processed_at)
    WHERE type = 'chat' AND processed_at IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_messages_recipient_sender_processed
    ON messages(recipient, sender, processed_at)
    WHERE type = 'chat' AND processed_at IS NOT NULL;

DROP TABLE IF EXISTS mailbox;
"#,
    // --- V10: command messages ---
    // SQLite cannot alter a CHECK constraint; recreate the table.
    r#"
ALTER TABLE messages ADD COLUMN result TEXT;

CREATE TABLE messages_new (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    sender      TEXT    NOT NULL,
    recipient   TEXT    NOT NULL,
    content     TEXT    NOT NULL,
    type        TEXT    NOT NULL CHECK(type IN ('chat', 'event', 'command')),
    task_id     INTEGER,
    delivered_at TEXT,
    seen_at     TEXT,
    processed_at TEXT,
    result      TEXT
);

INSERT INTO messages_new (id, timestamp, sender, recipient, content, type, task_id, delivered_at, seen_at, processed_at, result)
SELECT id, timestamp, sender, recipient, content, type, task_id, delivered_at, seen_at, processed_at, result
FROM messages;

DROP TABLE messages;
ALTER TABLE messages_new RENAME TO messages;

CREATE INDEX IF NOT EXISTS idx_messages_type ON messages(type);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_sender_recipient ON messages(sender, recipient);
CREATE INDEX IF NOT EXISTS idx_messages_task_id ON messages(task_id);
CREATE INDEX IF NOT EXISTS idx_messages_recipient_unread
    ON messages(recipient, delivered_at)
    WHERE type = 'chat' AND processed_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_messages_sender
    ON messages(sender) WHERE type = 'chat';
CREATE INDEX IF NOT EXISTS idx_messages_undelivered
    ON messages(id) WHERE type = 'chat' AND delivered_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_messages_recipient_processed
    ON messages(recipient, processed_at)
    WHERE type = 'chat' AND processed_at IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_messages_recipient_sender_processed
    ON messages(recipient, sender, processed_at)
    WHERE type = 'chat' AND processed_at IS NOT NULL;
"#,
    // --- V11: composite indexes for activity queries ---
    r#"
CREATE INDEX IF NOT EXISTS idx_messages_task_type ON messages(task_id, type);
CREATE INDEX IF NOT EXISTS idx_messages_task_ts ON messages(task_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_task_comments_task_ts ON task_comments(task_id, created_at);
"#,
    // --- V12: multi-team support ---
    r#"
CREATE TABLE IF NOT EXISTS teams (
    name        TEXT PRIMARY KEY,
    team_id     TEXT NOT NULL UNIQUE,
    created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE messages_new (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    sender      TEXT    NOT NULL,
    recipient   TEXT    NOT NULL,
    content     TEXT    NOT NULL,
    type        TEXT    NOT NULL CHECK(type IN ('chat', 'event', 'command')),
    task_id     INTEGER,
    delivered_at TEXT,
    seen_at     TEXT,
    processed_at TEXT,
    result      TEXT,
    team        TEXT    NOT NULL DEFAULT ''
);

INSERT INTO messages_new (id, timestamp, sender, recipient, content, type, task_id, delivered_at, seen_at, processed_at, result, team)
SELECT id, timestamp, sender, recipient, content, type, task_id, delivered_at, seen_at, processed_at, result, ''
FROM messages;

DROP TABLE messages;
ALTER TABLE messages_new RENAME TO messages;

CREATE INDEX IF NOT EXISTS idx_messages_type ON messages(type);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_sender_recipient ON messages(sender, recipient);
CREATE INDEX IF NOT EXISTS idx_messages_task_id ON messages(task_id);
CREATE INDEX IF NOT EXISTS idx_messages_recipient_unread
    ON messages(recipient, delivered_at)
    WHERE type = 'chat' AND processed_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_messages_sender
    ON messages(sender) WHERE type = 'chat';
CREATE INDEX IF NOT EXISTS idx_messages_undelivered
    ON messages(id) WHERE type = 'chat' AND delivered_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_messages_recipient_processed
    ON messages(recipient, processed_at)
    WHERE type = 'chat' AND processed_at IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_messages_recipient_sender_processed
    ON messages(recipient, sender, processed_at)
    WHERE type = 'chat' AND processed_at IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_messages_task_type ON messages(task_id, type);
CREATE INDEX IF NOT EXISTS idx_messages_task_ts ON messages(task_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_team_recipient ON messages(team, recipient);

ALTER TABLE sessions ADD COLUMN team TEXT NOT NULL DEFAULT '';
CREATE INDEX IF NOT EXISTS idx_sessions_team_agent ON sessions(team, agent);
CREATE INDEX IF NOT EXISTS idx_sessions_team_task_id ON sessions(team, task_id);

ALTER TABLE tasks ADD COLUMN team TEXT NOT NULL DEFAULT '';
CREATE INDEX IF NOT EXISTS idx_tasks_team_status ON tasks(team, status);
CREATE INDEX IF NOT EXISTS idx_tasks_team_id ON tasks(team, id);

ALTER TABLE reviews ADD COLUMN team TEXT NOT NULL DEFAULT '';
CREATE INDEX IF NOT EXISTS idx_reviews_team_task_id ON reviews(team, task_id);

ALTER TABLE review_comments ADD COLUMN team TEXT NOT NULL DEFAULT '';
CREATE INDEX IF NOT EXISTS idx_review_comments_team_task_attempt ON review_comments(team, task_id, attempt);

ALTER TABLE task_comments ADD COLUMN team TEXT NOT NULL DEFAULT '';
CREATE INDEX IF NOT EXISTS idx_task_comments_team_task_id ON task_comments(team, task_id);
"#,
    // --- V13: workflow columns on tasks ---
    r#"
ALTER TABLE tasks ADD COLUMN workflow TEXT NOT NULL DEFAULT 'default';
ALTER TABLE tasks ADD COLUMN workflow_version INTEGER NOT NULL DEFAULT 1;
CREATE INDEX IF NOT EXISTS idx_tasks_workflow ON tasks(workflow);
"#,
    // --- V14: free-form metadata JSON on tasks ---
    r#"
ALTER TABLE tasks ADD COLUMN metadata TEXT NOT NULL DEFAULT '{}';
UPDATE tasks SET workflow = 'default' WHERE workflow = 'standard';
"#,
    // --- V15: UUID translation tables ---
    r#"
CREATE TABLE IF NOT EXISTS team_ids (
    uuid TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    deleted INTEGER DEFAULT 0,
    created_at TEXT DEFAULT (datetime('now'))
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_team_ids_active ON team_ids(name) WHERE deleted = 0;

CREATE TABLE IF NOT EXISTS member_ids (
    uuid TEXT PRIMARY KEY,
    kind TEXT NOT NULL CHECK(kind IN ('agent', 'human')),
    team_uuid TEXT,
    name TEXT NOT NULL,
    deleted INTEGER DEFAULT 0,
    created_at TEXT DEFAULT (datetime('now'))
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_member_ids_active
    ON member_ids(kind, team_uuid, name) WHERE deleted = 0;

UPDATE teams SET team_id = team_id || '00000000000000000000000000' WHERE length(team_id) = 6;
"#,
    // --- V16: UUID columns on all data tables ---
    r#"
ALTER TABLE messages ADD COLUMN team_uuid TEXT NOT NULL DEFAULT '';
ALTER TABLE messages ADD COLUMN sender_uuid TEXT NOT NULL DEFAULT '';
ALTER TABLE messages ADD COLUMN recipient_uuid TEXT NOT NULL DEFAULT '';
CREATE INDEX IF NOT EXISTS idx_messages_team_uuid ON messages(team_uuid);
CREATE INDEX IF NOT EXISTS idx_messages_team_uuid_recipient_uuid ON messages(team_uuid, recipient_uuid);
CREATE INDEX IF NOT EXISTS idx_messages_recipient_uuid_unread
    ON messages(recipient_uuid, delivered_at) WHERE type='chat' AND processed_at IS NULL;

ALTER TABLE sessions ADD COLUMN team_uuid TEXT NOT NULL DEFAULT '';
ALTER TABLE sessions ADD COLUMN agent_uuid TEXT NOT NULL DEFAULT '';
CREATE INDEX IF NOT EXISTS idx_sessions_team_uuid_agent_uuid ON sessions(team_uuid, agent_uuid);

ALTER TABLE tasks ADD COLUMN team_uuid TEXT NOT NULL DEFAULT '';
ALTER TABLE tasks ADD COLUMN dri_uuid TEXT NOT NULL DEFAULT '';
ALTER TABLE tasks ADD COLUMN assignee_uuid TEXT NOT NULL DEFAULT '';
CREATE INDEX IF NOT EXISTS idx_tasks_team_uuid_status ON tasks(team_uuid, status);
CREATE INDEX IF NOT EXISTS idx_tasks_team_uuid_id ON tasks(team_uuid, id);

ALTER TABLE task_comments ADD COLUMN team_uuid TEXT NOT NULL DEFAULT '';
ALTER TABLE task_comments ADD COLUMN author_uuid TEXT NOT NULL DEFAULT '';
CREATE INDEX IF NOT EXISTS idx_task_comments_team_uuid_task_id ON task_comments(team_uuid, task_id);

ALTER TABLE reviews ADD COLUMN team_uuid TEXT NOT NULL DEFAULT '';
ALTER TABLE reviews ADD COLUMN reviewer_uuid TEXT NOT NULL DEFAULT '';
CREATE INDEX IF NOT EXISTS idx_reviews_team_uuid_task_id ON reviews(team_uuid, task_id);

ALTER TABLE review_comments ADD COLUMN team_uuid TEXT NOT NULL DEFAULT '';
ALTER TABLE review_comments ADD COLUMN author_uuid TEXT NOT NULL DEFAULT '';
CREATE INDEX IF NOT EXISTS idx_review_comments_team_uuid ON review_comments(team_uuid, task_id, attempt);
"#,
    // --- V17: merge retry scheduling ---
    r#"
ALTER TABLE tasks ADD COLUMN retry_after REAL;
"#,
];

/// The version the schema reaches after all migrations.
pub fn latest_version() -> i64 {
    MIGRATIONS.len() as i64
}

fn current_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_meta", [], |row| row.get(0))
        .map_err(|e| DelegateError::Database(format!("schema_meta: {e}")))?;
    Ok(version.unwrap_or(0))
}

fn bootstrap_meta(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_meta (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT    NOT NULL
                       DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )
        "#,
    )
    .map_err(|e| DelegateError::Database(format!("bootstrap schema_meta: {e}")))?;
    Ok(())
}

/// Snapshot the DB file before upgrading a non-empty database.
fn backup_before_upgrade(home: &Home, current: i64) -> Result<Option<std::path::PathBuf>> {
    let db_file = home.db_path();
    if current == 0 || !db_file.exists() {
        return Ok(None);
    }
    let ts = chrono::Utc::now().format("%Y%m%d%H%M%S").to_string();
    let backup = home.db_backup_path(current, &ts);
    std::fs::copy(&db_file, &backup)?;
    tracing::info!("DB backup written to {}", backup.display());
    Ok(Some(backup))
}

fn restore_backup(home: &Home, backup: &Path) {
    let db_file = home.db_path();
    if let Err(e) = std::fs::copy(backup, &db_file) {
        tracing::error!("Failed to restore DB backup {}: {e}", backup.display());
    } else {
        tracing::warn!("DB restored from {}", backup.display());
    }
}

/// Verify the core tables exist after migration, or fail health check.
fn health_check(conn: &Connection) -> Result<()> {
    for table in ["messages", "sessions", "tasks"] {
        let found: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                params![table],
                |row| row.get(0),
            )
            .map_err(|e| DelegateError::Database(format!("health check: {e}")))?;
        if found == 0 {
            return Err(DelegateError::Migration(format!(
                "core table '{table}' missing after migration"
            )));
        }
    }
    Ok(())
}

/// Apply all pending migrations to the global database.
pub fn ensure_schema(home: &Home) -> Result<()> {
    let path = home.db_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut conn = Connection::open(&path)
        .map_err(|e| DelegateError::Database(format!("open {}: {e}", path.display())))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
        .map_err(|e| DelegateError::Database(format!("pragma: {e}")))?;

    bootstrap_meta(&conn)?;
    let current = current_version(&conn)?;
    let target = latest_version();

    if current > target {
        return Err(DelegateError::Migration(format!(
            "database is at V{current} but this build only knows V{target}"
        )));
    }

    if current < target {
        let backup = backup_before_upgrade(home, current)?;

        for version in (current + 1)..=target {
            let sql = MIGRATIONS[(version - 1) as usize];
            tracing::info!("Applying migration V{version}");
            let applied = apply_one(&mut conn, version, sql);
            if let Err(e) = applied {
                if let Some(backup) = &backup {
                    restore_backup(home, backup);
                }
                return Err(DelegateError::Migration(format!(
                    "migration V{version} failed: {e}"
                )));
            }
            tracing::info!("Migration V{version} applied");
        }
    }

    health_check(&conn)?;

    // Idempotent, safe to run on every startup.
    backfill_uuid_tables(&conn, home)?;
    Ok(())
}

fn apply_one(conn: &mut Connection, version: i64, sql: &str) -> Result<()> {
    // BEGIN IMMEDIATE acquires the write lock up front so no other
    // writer sneaks in between statements.
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| DelegateError::Database(format!("begin: {e}")))?;
    tx.execute_batch(sql)
        .map_err(|e| DelegateError::Database(format!("{e}")))?;
    tx.execute(
        "INSERT INTO schema_meta (version) VALUES (?1)",
        params![version],
    )
    .map_err(|e| DelegateError::Database(format!("version bump: {e}")))?;
    tx.commit()
        .map_err(|e| DelegateError::Database(format!("commit: {e}")))?;
    Ok(())
}

// ── UUID backfill ──────────────────────────────────────────────────

/// Resolve a member name the flexible way: agent in team, then human.
/// Returns an empty string when the name does not resolve; such rows
/// are tolerated and reconverge on a later backfill run.
fn resolve_flexible(conn: &Connection, team_uuid: &str, name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    let agent: Option<String> = conn
        .query_row(
            "SELECT uuid FROM member_ids WHERE kind = 'agent' AND team_uuid = ?1 AND name = ?2 AND deleted = 0",
            params![team_uuid, name],
            |row| row.get(0),
        )
        .ok();
    if let Some(uuid) = agent {
        return uuid;
    }
    conn.query_row(
        "SELECT uuid FROM member_ids WHERE kind = 'human' AND team_uuid IS NULL AND name = ?1 AND deleted = 0",
        params![name],
        |row| row.get(0),
    )
    .unwrap_or_default()
}

fn team_uuid_for(conn: &Connection, team_name: &str) -> Option<String> {
    conn.query_row(
        "SELECT uuid FROM team_ids WHERE name = ?1 AND deleted = 0",
        params![team_name],
        |row| row.get(0),
    )
    .ok()
}

/// Backfill `team_ids`, `member_ids`, and the `*_uuid` columns from
/// existing name columns and the filesystem inventory. Idempotent.
pub fn backfill_uuid_tables(conn: &Connection, home: &Home) -> Result<()> {
    // Skip until V15 has created the translation tables.
    let has_team_ids: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='team_ids'",
            [],
            |row| row.get(0),
        )
        .map_err(|e| DelegateError::Database(format!("backfill: {e}")))?;
    if has_team_ids == 0 {
        return Ok(());
    }

    // Part 1: team_ids from the teams table.
    {
        let mut stmt = conn
            .prepare("SELECT name, team_id FROM teams")
            .map_err(|e| DelegateError::Database(format!("backfill teams: {e}")))?;
        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| DelegateError::Database(format!("backfill teams: {e}")))?
            .filter_map(|r| r.ok())
            .collect();
        for (name, team_id) in rows {
            conn.execute(
                "INSERT OR IGNORE INTO team_ids (uuid, name) VALUES (?1, ?2)",
                params![team_id, name],
            )
            .map_err(|e| DelegateError::Database(format!("backfill team_ids: {e}")))?;
        }
    }

    // Part 2: member_ids from the filesystem. The teams/ subtree is
    // keyed by team UUID; agents are its agents/ children.
    let teams_dir = home.teams_dir();
    if teams_dir.is_dir() {
        for entry in std::fs::read_dir(&teams_dir)?.flatten() {
            let team_dir = entry.path();
            if !team_dir.is_dir() {
                continue;
            }
            let team_uuid = entry.file_name().to_string_lossy().to_string();
            let known: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM team_ids WHERE uuid = ?1",
                    params![team_uuid],
                    |row| row.get(0),
                )
                .unwrap_or(0);
            if known == 0 {
                continue;
            }
            let agents_dir = team_dir.join("agents");
            if !agents_dir.is_dir() {
                continue;
            }
            for agent_entry in std::fs::read_dir(&agents_dir)?.flatten() {
                if !agent_entry.path().is_dir() {
                    continue;
                }
                let agent_name = agent_entry.file_name().to_string_lossy().to_string();
                conn.execute(
                    "INSERT OR IGNORE INTO member_ids (uuid, kind, team_uuid, name) VALUES (?1, 'agent', ?2, ?3)",
                    params![uuid::Uuid::new_v4().simple().to_string(), team_uuid, agent_name],
                )
                .map_err(|e| DelegateError::Database(format!("backfill member_ids: {e}")))?;
            }
        }
    }

    // Humans from protected/members/*.yaml.
    for member in human_members(home) {
        conn.execute(
            "INSERT OR IGNORE INTO member_ids (uuid, kind, team_uuid, name) VALUES (?1, 'human', NULL, ?2)",
            params![uuid::Uuid::new_v4().simple().to_string(), member.name],
        )
        .map_err(|e| DelegateError::Database(format!("backfill member_ids: {e}")))?;
    }

    // Part 3: *_uuid columns, once V16 has added them.
    let has_uuid_cols: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM pragma_table_info('messages') WHERE name='team_uuid'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);
    if has_uuid_cols == 0 {
        return Ok(());
    }

    // Messages: team_uuid by name, then sender/recipient flexibly.
    conn.execute(
        "UPDATE messages SET team_uuid = COALESCE(
            (SELECT uuid FROM team_ids WHERE name = messages.team AND deleted = 0), '')
         WHERE team_uuid = ''",
        [],
    )
    .map_err(|e| DelegateError::Database(format!("backfill messages: {e}")))?;

    let pending: Vec<(i64, String, String, String)> = {
        let mut stmt = conn
            .prepare("SELECT id, team, sender, recipient FROM messages WHERE sender_uuid = ''")
            .map_err(|e| DelegateError::Database(format!("backfill messages: {e}")))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .map_err(|e| DelegateError::Database(format!("backfill messages: {e}")))?
            .filter_map(|r| r.ok())
            .collect();
        rows
    };
    for (id, team, sender, recipient) in pending {
        let Some(team_uuid) = team_uuid_for(conn, &team) else {
            continue;
        };
        let sender_uuid = resolve_flexible(conn, &team_uuid, &sender);
        let recipient_uuid = resolve_flexible(conn, &team_uuid, &recipient);
        if !sender_uuid.is_empty() && !recipient_uuid.is_empty() {
            conn.execute(
                "UPDATE messages SET sender_uuid = ?1, recipient_uuid = ?2 WHERE id = ?3",
                params![sender_uuid, recipient_uuid, id],
            )
            .map_err(|e| DelegateError::Database(format!("backfill messages: {e}")))?;
        }
    }

    // Sessions.
    conn.execute(
        "UPDATE sessions SET
            team_uuid = COALESCE(
                (SELECT uuid FROM team_ids WHERE name = sessions.team AND deleted = 0), ''),
            agent_uuid = COALESCE(
                (SELECT m.uuid FROM member_ids m
                 JOIN team_ids t ON m.team_uuid = t.uuid
                 WHERE m.kind = 'agent' AND t.name = sessions.team
                   AND m.name = sessions.agent AND m.deleted = 0), '')
         WHERE team_uuid = ''",
        [],
    )
    .map_err(|e| DelegateError::Database(format!("backfill sessions: {e}")))?;

    // Tasks: dri/assignee flexibly.
    let pending: Vec<(i64, String, String, String)> = {
        let mut stmt = conn
            .prepare("SELECT id, team, dri, assignee FROM tasks WHERE team_uuid = ''")
            .map_err(|e| DelegateError::Database(format!("backfill tasks: {e}")))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .map_err(|e| DelegateError::Database(format!("backfill tasks: {e}")))?
            .filter_map(|r| r.ok())
            .collect();
        rows
    };
    for (id, team, dri, assignee) in pending {
        let Some(team_uuid) = team_uuid_for(conn, &team) else {
            continue;
        };
        let dri_uuid = resolve_flexible(conn, &team_uuid, &dri);
        let assignee_uuid = resolve_flexible(conn, &team_uuid, &assignee);
        conn.execute(
            "UPDATE tasks SET team_uuid = ?1, dri_uuid = ?2, assignee_uuid = ?3 WHERE id = ?4",
            params![team_uuid, dri_uuid, assignee_uuid, id],
        )
        .map_err(|e| DelegateError::Database(format!("backfill tasks: {e}")))?;
    }

    // Side tables resolve their team through the owning task.
    for (table, author_col) in [
        ("task_comments", "author"),
        ("reviews", "reviewer"),
        ("review_comments", "author"),
    ] {
        let uuid_col = if author_col == "reviewer" {
            "reviewer_uuid"
        } else {
            "author_uuid"
        };
        let pending: Vec<(i64, String, String)> = {
            let sql = format!(
                "SELECT {table}.id, tasks.team, {table}.{author_col} FROM {table}
                 JOIN tasks ON {table}.task_id = tasks.id
                 WHERE {table}.team_uuid = ''"
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| DelegateError::Database(format!("backfill {table}: {e}")))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .map_err(|e| DelegateError::Database(format!("backfill {table}: {e}")))?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };
        for (id, team, author) in pending {
            let Some(team_uuid) = team_uuid_for(conn, &team) else {
                continue;
            };
            let author_uuid = resolve_flexible(conn, &team_uuid, &author);
            let sql =
                format!("UPDATE {table} SET team_uuid = ?1, {uuid_col} = ?2 WHERE id = ?3");
            conn.execute(&sql, params![team_uuid, author_uuid, id])
                .map_err(|e| DelegateError::Database(format!("backfill {table}: {e}")))?;
        }
    }

    Ok(())
}
