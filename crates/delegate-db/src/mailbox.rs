//! Message mailbox — chat/event/command persistence and the
//! delivered/seen/processed lifecycle that drives turn dispatch.

use rusqlite::{params, Connection};

use delegate_core::error::{DelegateError, Result};
use delegate_core::types::{Message, MessageType};

use crate::ids::IdRegistry;
use crate::now_ts;

const MSG_COLUMNS: &str = "id, timestamp, sender, recipient, content, type, task_id, \
     delivered_at, seen_at, processed_at, result, team, team_uuid, sender_uuid, recipient_uuid";

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let type_str: String = row.get(5)?;
    Ok(Message {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        sender: row.get(2)?,
        recipient: row.get(3)?,
        content: row.get(4)?,
        msg_type: MessageType::parse(&type_str).unwrap_or(MessageType::Chat),
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
}

fn collect_messages(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::types::ToSql],
) -> Result<Vec<Message>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| DelegateError::Database(format!("mailbox query: {e}")))?;
    let rows = stmt
        .query_map(params, row_to_message)
        .map_err(|e| DelegateError::Database(format!("mailbox query: {e}")))?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row.map_err(|e| DelegateError::Database(format!("row: {e}")))?);
    }
    Ok(messages)
}

/// Send a chat message: insert with `delivered_at = now`.
///
/// Sender/recipient UUIDs are resolved flexibly; names that do not
/// resolve keep empty UUIDs (tolerated, reconverged by the backfill).
pub fn send(
    conn: &Connection,
    ids: &IdRegistry,
    team: &str,
    sender: &str,
    recipient: &str,
    content: &str,
    task_id: Option<i64>,
) -> Result<i64> {
    let now = now_ts();
    let team_uuid = ids.resolve_team(conn, team).unwrap_or_default();
    let sender_uuid = if team_uuid.is_empty() {
        String::new()
    } else {
        ids.resolve_member_flexible(conn, &team_uuid, sender)
            .unwrap_or_default()
    };
    let recipient_uuid = if team_uuid.is_empty() {
        String::new()
    } else {
        ids.resolve_member_flexible(conn, &team_uuid, recipient)
            .unwrap_or_default()
    };
    conn.execute(
        "INSERT INTO messages
            (timestamp, sender, recipient, content, type, task_id, delivered_at,
             team, team_uuid, sender_uuid, recipient_uuid)
         VALUES (?1, ?2, ?3, ?4, 'chat', ?5, ?1, ?6, ?7, ?8, ?9)",
        params![now, sender, recipient, content, task_id, team, team_uuid, sender_uuid, recipient_uuid],
    )
    .map_err(|e| DelegateError::Database(format!("send: {e}")))?;
    Ok(conn.last_insert_rowid())
}

/// Record an audit event row (type='event'). Best-effort callers
/// ignore the result.
pub fn log_event(
    conn: &Connection,
    ids: &IdRegistry,
    team: &str,
    content: &str,
    task_id: Option<i64>,
) -> Result<i64> {
    let team_uuid = ids.resolve_team(conn, team).unwrap_or_default();
    conn.execute(
        "INSERT INTO messages (timestamp, sender, recipient, content, type, task_id, team, team_uuid)
         VALUES (?1, 'system', '', ?2, 'event', ?3, ?4, ?5)",
        params![now_ts(), content, task_id, team, team_uuid],
    )
    .map_err(|e| DelegateError::Database(format!("log_event: {e}")))?;
    Ok(conn.last_insert_rowid())
}

/// Chat rows addressed to `agent`, oldest first. With `unread_only`,
/// restrict to `processed_at IS NULL`.
pub fn read_inbox(
    conn: &Connection,
    team: &str,
    agent: &str,
    unread_only: bool,
) -> Result<Vec<Message>> {
    let sql = if unread_only {
        format!(
            "SELECT {MSG_COLUMNS} FROM messages
             WHERE team = ?1 AND recipient = ?2 AND type = 'chat' AND processed_at IS NULL
             ORDER BY id ASC"
        )
    } else {
        format!(
            "SELECT {MSG_COLUMNS} FROM messages
             WHERE team = ?1 AND recipient = ?2 AND type = 'chat'
             ORDER BY id ASC"
        )
    };
    collect_messages(conn, &sql, &[&team, &agent])
}

/// Chat rows sent by `agent`. With `pending_only`, restrict to rows the
/// recipient has not yet processed.
pub fn read_outbox(
    conn: &Connection,
    team: &str,
    agent: &str,
    pending_only: bool,
) -> Result<Vec<Message>> {
    let sql = if pending_only {
        format!(
            "SELECT {MSG_COLUMNS} FROM messages
             WHERE team = ?1 AND sender = ?2 AND type = 'chat' AND processed_at IS NULL
             ORDER BY id ASC"
        )
    } else {
        format!(
            "SELECT {MSG_COLUMNS} FROM messages
             WHERE team = ?1 AND sender = ?2 AND type = 'chat'
             ORDER BY id ASC"
        )
    };
    collect_messages(conn, &sql, &[&team, &agent])
}

/// Mark a batch as seen. Idempotent: already-seen rows keep their
/// original timestamp.
pub fn mark_seen_batch(conn: &Connection, ids: &[i64]) -> Result<()> {
    let now = now_ts();
    for id in ids {
        conn.execute(
            "UPDATE messages SET seen_at = COALESCE(seen_at, ?1) WHERE id = ?2",
            params![now, id],
        )
        .map_err(|e| DelegateError::Database(format!("mark_seen: {e}")))?;
    }
    Ok(())
}

/// Mark a batch as processed. Also stamps `seen_at` when missing, so
/// `processed_at` set always implies `seen_at <= processed_at`.
pub fn mark_processed_batch(conn: &Connection, ids: &[i64]) -> Result<()> {
    let now = now_ts();
    for id in ids {
        conn.execute(
            "UPDATE messages
             SET seen_at = COALESCE(seen_at, ?1),
                 processed_at = COALESCE(processed_at, ?1)
             WHERE id = ?2",
            params![now, id],
        )
        .map_err(|e| DelegateError::Database(format!("mark_processed: {e}")))?;
    }
    Ok(())
}

/// Distinct recipients of unprocessed chat rows — the dispatcher's
/// primary driver.
pub fn agents_with_unread(conn: &Connection, team: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT recipient FROM messages
             WHERE team = ?1 AND type = 'chat' AND processed_at IS NULL
             ORDER BY recipient",
        )
        .map_err(|e| DelegateError::Database(format!("agents_with_unread: {e}")))?;
    let rows = stmt
        .query_map(params![team], |row| row.get::<_, String>(0))
        .map_err(|e| DelegateError::Database(format!("agents_with_unread: {e}")))?;
    let mut agents = Vec::new();
    for row in rows {
        agents.push(row.map_err(|e| DelegateError::Database(format!("row: {e}")))?);
    }
    Ok(agents)
}

pub fn count_unread(conn: &Connection, team: &str, agent: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM messages
         WHERE team = ?1 AND recipient = ?2 AND type = 'chat' AND processed_at IS NULL",
        params![team, agent],
        |row| row.get(0),
    )
    .map_err(|e| DelegateError::Database(format!("count_unread: {e}")))
}

/// A bounded slice of recent chat between `agent` and `peer` (both
/// directions), or with anyone when `peer` is None. Returned oldest
/// first; used to build prompt history.
pub fn recent_conversation(
    conn: &Connection,
    team: &str,
    agent: &str,
    peer: Option<&str>,
    limit: usize,
) -> Result<Vec<Message>> {
    let limit = limit as i64;
    let mut messages = match peer {
        Some(peer) => {
            let sql = format!(
                "SELECT {MSG_COLUMNS} FROM messages
                 WHERE team = ?1 AND type = 'chat'
                   AND ((sender = ?2 AND recipient = ?3) OR (sender = ?3 AND recipient = ?2))
                 ORDER BY id DESC LIMIT ?4"
            );
            collect_messages(conn, &sql, &[&team, &agent, &peer, &limit])?
        }
        None => {
            let sql = format!(
                "SELECT {MSG_COLUMNS} FROM messages
                 WHERE team = ?1 AND type = 'chat' AND (sender = ?2 OR recipient = ?2)
                 ORDER BY id DESC LIMIT ?3"
            );
            collect_messages(conn, &sql, &[&team, &agent, &limit])?
        }
    };
    messages.reverse();
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_db;
    use delegate_core::types::MemberKind;

    fn setup() -> (tempfile::TempDir, crate::Db, IdRegistry) {
        let (dir, db) = test_db();
        let ids = IdRegistry::new();
        {
            let conn = db.conn().unwrap();
            let team = ids.register_team(&conn, "alpha", None).unwrap();
            for agent in ["alice", "bob", "carol"] {
                ids.register_member(&conn, MemberKind::Agent, Some(&team), agent)
                    .unwrap();
            }
        }
        (dir, db, ids)
    }

    #[test]
    fn test_send_sets_delivered_and_uuids() {
        let (_dir, db, ids) = setup();
        let conn = db.conn().unwrap();
        send(&conn, &ids, "alpha", "bob", "alice", "hello", None).unwrap();

        let inbox = read_inbox(&conn, "alpha", "alice", true).unwrap();
        assert_eq!(inbox.len(), 1);
        let msg = &inbox[0];
        assert!(msg.delivered_at.is_some());
        assert!(msg.seen_at.is_none());
        assert!(msg.processed_at.is_none());
        assert_eq!(msg.team_uuid.len(), 32);
        assert_eq!(msg.sender_uuid.len(), 32);
    }

    #[test]
    fn test_lifecycle_ordering_invariant() {
        let (_dir, db, ids) = setup();
        let conn = db.conn().unwrap();
        let id = send(&conn, &ids, "alpha", "bob", "alice", "hi", None).unwrap();

        // Processing without an explicit seen still stamps seen_at.
        mark_processed_batch(&conn, &[id]).unwrap();
        let msg = &read_inbox(&conn, "alpha", "alice", false).unwrap()[0];
        let seen = msg.seen_at.clone().unwrap();
        let processed = msg.processed_at.clone().unwrap();
        assert!(seen <= processed);
    }

    #[test]
    fn test_unread_filtering_and_ordering() {
        let (_dir, db, ids) = setup();
        let conn = db.conn().unwrap();
        let m1 = send(&conn, &ids, "alpha", "bob", "alice", "first", None).unwrap();
        let _m2 = send(&conn, &ids, "alpha", "bob", "alice", "second", None).unwrap();

        mark_processed_batch(&conn, &[m1]).unwrap();
        let unread = read_inbox(&conn, "alpha", "alice", true).unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].content, "second");

        let all = read_inbox(&conn, "alpha", "alice", false).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].content, "first"); // oldest first
    }

    #[test]
    fn test_agents_with_unread() {
        let (_dir, db, ids) = setup();
        let conn = db.conn().unwrap();
        let m = send(&conn, &ids, "alpha", "bob", "alice", "x", None).unwrap();
        send(&conn, &ids, "alpha", "alice", "carol", "y", None).unwrap();

        let agents = agents_with_unread(&conn, "alpha").unwrap();
        assert_eq!(agents, vec!["alice", "carol"]);

        mark_processed_batch(&conn, &[m]).unwrap();
        let agents = agents_with_unread(&conn, "alpha").unwrap();
        assert_eq!(agents, vec!["carol"]);
        assert_eq!(count_unread(&conn, "alpha", "alice").unwrap(), 0);
        assert_eq!(count_unread(&conn, "alpha", "carol").unwrap(), 1);
    }

    #[test]
    fn test_events_do_not_drive_dispatch() {
        let (_dir, db, ids) = setup();
        let conn = db.conn().unwrap();
        log_event(&conn, &ids, "alpha", "T0001 merge started", Some(1)).unwrap();
        assert!(agents_with_unread(&conn, "alpha").unwrap().is_empty());
    }

    #[test]
    fn test_recent_conversation_with_peer() {
        let (_dir, db, ids) = setup();
        let conn = db.conn().unwrap();
        send(&conn, &ids, "alpha", "bob", "alice", "one", None).unwrap();
        send(&conn, &ids, "alpha", "alice", "bob", "two", None).unwrap();
        send(&conn, &ids, "alpha", "carol", "alice", "noise", None).unwrap();
        send(&conn, &ids, "alpha", "bob", "alice", "three", None).unwrap();

        let convo = recent_conversation(&conn, "alpha", "alice", Some("bob"), 10).unwrap();
        let bodies: Vec<_> = convo.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(bodies, vec!["one", "two", "three"]);

        // Limit keeps the most recent slice, still oldest-first.
        let convo = recent_conversation(&conn, "alpha", "alice", Some("bob"), 2).unwrap();
        let bodies: Vec<_> = convo.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(bodies, vec!["two", "three"]);
    }

    #[test]
    fn test_outbox_pending_only() {
        let (_dir, db, ids) = setup();
        let conn = db.conn().unwrap();
        let m1 = send(&conn, &ids, "alpha", "alice", "bob", "a", None).unwrap();
        send(&conn, &ids, "alpha", "alice", "bob", "b", None).unwrap();
        mark_processed_batch(&conn, &[m1]).unwrap();

        let pending = read_outbox(&conn, "alpha", "alice", true).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content, "b");
        assert_eq!(read_outbox(&conn, "alpha", "alice", false).unwrap().len(), 2);
    }

    #[test]
    fn test_team_partitioning() {
        let (_dir, db, ids) = setup();
        let conn = db.conn().unwrap();
        ids.register_team(&conn, "beta", None).unwrap();
        send(&conn, &ids, "alpha", "bob", "alice", "for alpha", None).unwrap();
        send(&conn, &ids, "beta", "bob", "alice", "for beta", None).unwrap();

        assert_eq!(read_inbox(&conn, "alpha", "alice", true).unwrap().len(), 1);
        assert_eq!(agents_with_unread(&conn, "beta").unwrap(), vec!["alice"]);
    }
}
