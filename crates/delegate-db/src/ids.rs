//! UUID translation layer for team and member identities.
//!
//! All DB-facing code uses UUIDs for queries; public APIs keep working
//! with names and translate through this registry. Registration is
//! idempotent for active entries; soft deletion frees the name for
//! reuse and a re-registration mints a fresh UUID.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use delegate_core::error::{DelegateError, Result};
use delegate_core::types::{Member, MemberKind};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Team(String),
    Member(MemberKind, Option<String>, String),
}

/// Name <-> UUID resolution with an in-process cache.
///
/// The cache is invalidated wholesale on any register/delete; the
/// working set (teams x members) is small enough that a plain map
/// beats an eviction policy.
#[derive(Clone, Default)]
pub struct IdRegistry {
    cache: Arc<Mutex<HashMap<CacheKey, String>>>,
}

impl IdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    fn cached(&self, key: &CacheKey) -> Option<String> {
        self.cache.lock().ok()?.get(key).cloned()
    }

    fn store(&self, key: CacheKey, value: String) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, value);
        }
    }

    // ── Resolve: name -> UUID ──────────────────────────────────────

    /// Name -> UUID for an active (non-deleted) team.
    pub fn resolve_team(&self, conn: &Connection, name: &str) -> Result<String> {
        let key = CacheKey::Team(name.to_string());
        if let Some(uuid) = self.cached(&key) {
            return Ok(uuid);
        }
        let uuid: Option<String> = conn
            .query_row(
                "SELECT uuid FROM team_ids WHERE name = ?1 AND deleted = 0",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| DelegateError::Database(format!("resolve_team: {e}")))?;
        let uuid =
            uuid.ok_or_else(|| DelegateError::NotFound(format!("no active team: {name}")))?;
        self.store(key, uuid.clone());
        Ok(uuid)
    }

    /// Name -> UUID for an active agent or human.
    pub fn resolve_member(
        &self,
        conn: &Connection,
        kind: MemberKind,
        team_uuid: Option<&str>,
        name: &str,
    ) -> Result<String> {
        let key = CacheKey::Member(kind, team_uuid.map(str::to_string), name.to_string());
        if let Some(uuid) = self.cached(&key) {
            return Ok(uuid);
        }
        let uuid: Option<String> = match team_uuid {
            Some(team_uuid) => conn
                .query_row(
                    "SELECT uuid FROM member_ids
                     WHERE kind = ?1 AND team_uuid = ?2 AND name = ?3 AND deleted = 0",
                    params![kind.as_str(), team_uuid, name],
                    |row| row.get(0),
                )
                .optional(),
            None => conn
                .query_row(
                    "SELECT uuid FROM member_ids
                     WHERE kind = ?1 AND team_uuid IS NULL AND name = ?2 AND deleted = 0",
                    params![kind.as_str(), name],
                    |row| row.get(0),
                )
                .optional(),
        }
        .map_err(|e| DelegateError::Database(format!("resolve_member: {e}")))?;
        let uuid = uuid.ok_or_else(|| {
            DelegateError::NotFound(format!(
                "no active {kind}: {name} (team_uuid={team_uuid:?})"
            ))
        })?;
        self.store(key, uuid.clone());
        Ok(uuid)
    }

    /// Resolve a name that could be either an agent or a human:
    /// agent in the team first, then human globally. The common case
    /// for sender/recipient/assignee fields.
    pub fn resolve_member_flexible(
        &self,
        conn: &Connection,
        team_uuid: &str,
        name: &str,
    ) -> Result<String> {
        if let Ok(uuid) = self.resolve_member(conn, MemberKind::Agent, Some(team_uuid), name) {
            return Ok(uuid);
        }
        self.resolve_member(conn, MemberKind::Human, None, name)
            .map_err(|_| {
                DelegateError::NotFound(format!(
                    "no active agent or human: {name} (team_uuid={team_uuid})"
                ))
            })
    }

    // ── Lookup: UUID -> name ───────────────────────────────────────

    pub fn lookup_team(&self, conn: &Connection, team_uuid: &str) -> Result<String> {
        conn.query_row(
            "SELECT name FROM team_ids WHERE uuid = ?1",
            params![team_uuid],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| DelegateError::Database(format!("lookup_team: {e}")))?
        .ok_or_else(|| DelegateError::NotFound(format!("unknown team UUID: {team_uuid}")))
    }

    pub fn lookup_member(&self, conn: &Connection, member_uuid: &str) -> Result<Member> {
        let row: Option<(String, Option<String>, String)> = conn
            .query_row(
                "SELECT kind, team_uuid, name FROM member_ids WHERE uuid = ?1",
                params![member_uuid],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| DelegateError::Database(format!("lookup_member: {e}")))?;
        let (kind, team_uuid, name) = row
            .ok_or_else(|| DelegateError::NotFound(format!("unknown member UUID: {member_uuid}")))?;
        let kind = MemberKind::parse(&kind)
            .ok_or_else(|| DelegateError::Database(format!("bad member kind: {kind}")))?;
        Ok(Member {
            uuid: member_uuid.to_string(),
            kind,
            team_uuid,
            name,
        })
    }

    // ── Register ───────────────────────────────────────────────────

    /// Register a team, returning its 32-char hex UUID. Idempotent for
    /// an active team with the same name.
    pub fn register_team(
        &self,
        conn: &Connection,
        name: &str,
        team_uuid: Option<&str>,
    ) -> Result<String> {
        if let Ok(existing) = self.resolve_team(conn, name) {
            return Ok(existing);
        }
        let new_uuid = team_uuid
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        conn.execute(
            "INSERT INTO team_ids (uuid, name) VALUES (?1, ?2)",
            params![new_uuid, name],
        )
        .map_err(|e| DelegateError::Database(format!("register_team: {e}")))?;
        self.invalidate();
        Ok(new_uuid)
    }

    /// Register a member, returning its UUID. Idempotent for an active
    /// `(kind, team_uuid, name)` triple.
    pub fn register_member(
        &self,
        conn: &Connection,
        kind: MemberKind,
        team_uuid: Option<&str>,
        name: &str,
    ) -> Result<String> {
        if let Ok(existing) = self.resolve_member(conn, kind, team_uuid, name) {
            return Ok(existing);
        }
        let new_uuid = uuid::Uuid::new_v4().simple().to_string();
        conn.execute(
            "INSERT INTO member_ids (uuid, kind, team_uuid, name) VALUES (?1, ?2, ?3, ?4)",
            params![new_uuid, kind.as_str(), team_uuid, name],
        )
        .map_err(|e| DelegateError::Database(format!("register_member: {e}")))?;
        self.invalidate();
        Ok(new_uuid)
    }

    // ── Deletion ───────────────────────────────────────────────────

    /// Mark a team and all its agents as deleted. Names become free
    /// for reuse; re-registering mints new UUIDs.
    pub fn soft_delete_team(&self, conn: &Connection, team_uuid: &str) -> Result<()> {
        conn.execute(
            "UPDATE team_ids SET deleted = 1 WHERE uuid = ?1",
            params![team_uuid],
        )
        .map_err(|e| DelegateError::Database(format!("soft_delete_team: {e}")))?;
        conn.execute(
            "UPDATE member_ids SET deleted = 1 WHERE team_uuid = ?1",
            params![team_uuid],
        )
        .map_err(|e| DelegateError::Database(format!("soft_delete_team members: {e}")))?;
        self.invalidate();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_db;

    #[test]
    fn test_uuid_roundtrip() {
        let (_dir, db) = test_db();
        let conn = db.conn().unwrap();
        let ids = IdRegistry::new();

        let team = ids.register_team(&conn, "alpha", None).unwrap();
        assert_eq!(team.len(), 32);
        assert_eq!(ids.resolve_team(&conn, "alpha").unwrap(), team);
        assert_eq!(ids.lookup_team(&conn, &team).unwrap(), "alpha");

        let agent = ids
            .register_member(&conn, MemberKind::Agent, Some(&team), "worker")
            .unwrap();
        let member = ids.lookup_member(&conn, &agent).unwrap();
        assert_eq!(member.name, "worker");
        assert_eq!(member.kind, MemberKind::Agent);
        assert_eq!(member.team_uuid.as_deref(), Some(team.as_str()));
    }

    #[test]
    fn test_register_is_idempotent() {
        let (_dir, db) = test_db();
        let conn = db.conn().unwrap();
        let ids = IdRegistry::new();

        let a = ids.register_team(&conn, "alpha", None).unwrap();
        let b = ids.register_team(&conn, "alpha", None).unwrap();
        assert_eq!(a, b);

        let m1 = ids
            .register_member(&conn, MemberKind::Human, None, "alice")
            .unwrap();
        let m2 = ids
            .register_member(&conn, MemberKind::Human, None, "alice")
            .unwrap();
        assert_eq!(m1, m2);
    }

    #[test]
    fn test_soft_delete_frees_name_and_mints_new_uuid() {
        let (_dir, db) = test_db();
        let conn = db.conn().unwrap();
        let ids = IdRegistry::new();

        let first = ids.register_team(&conn, "alpha", None).unwrap();
        let agent = ids
            .register_member(&conn, MemberKind::Agent, Some(&first), "worker")
            .unwrap();

        ids.soft_delete_team(&conn, &first).unwrap();
        assert!(ids.resolve_team(&conn, "alpha").is_err());
        // Cascade: the agent is gone too.
        assert!(ids
            .resolve_member(&conn, MemberKind::Agent, Some(&first), "worker")
            .is_err());
        // The deleted UUID still resolves backwards for history.
        assert_eq!(ids.lookup_team(&conn, &first).unwrap(), "alpha");
        assert_eq!(ids.lookup_member(&conn, &agent).unwrap().name, "worker");

        let second = ids.register_team(&conn, "alpha", None).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_flexible_resolution_prefers_agent() {
        let (_dir, db) = test_db();
        let conn = db.conn().unwrap();
        let ids = IdRegistry::new();

        let team = ids.register_team(&conn, "alpha", None).unwrap();
        let human = ids
            .register_member(&conn, MemberKind::Human, None, "sam")
            .unwrap();
        // Same name as an agent in the team: the agent wins.
        let agent = ids
            .register_member(&conn, MemberKind::Agent, Some(&team), "sam")
            .unwrap();
        assert_eq!(ids.resolve_member_flexible(&conn, &team, "sam").unwrap(), agent);

        // Name only known as a human: falls back globally.
        let only_human = ids
            .register_member(&conn, MemberKind::Human, None, "pat")
            .unwrap();
        assert_eq!(
            ids.resolve_member_flexible(&conn, &team, "pat").unwrap(),
            only_human
        );
        assert!(ids.resolve_member_flexible(&conn, &team, "ghost").is_err());
        let _ = human;
    }
}
