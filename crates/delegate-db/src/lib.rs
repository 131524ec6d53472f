//! # Delegate DB
//!
//! Single global SQLite database under `protected/db.sqlite` with
//! versioned migrations, UUID translation tables, the message mailbox,
//! the task store, sessions, and reviews.
//!
//! Connection policy: every operation opens a fresh connection (WAL
//! mode, 5 s busy timeout) and closes it when dropped; transactions are
//! managed explicitly where multi-statement atomicity matters. The
//! schema-verified version is process-scoped state on the [`Db`] handle,
//! not a global.

pub mod ids;
pub mod mailbox;
pub mod migrations;
pub mod reviews;
pub mod sessions;
pub mod tasks;

use std::sync::{Arc, Mutex};

pub use rusqlite;
use rusqlite::Connection;

use delegate_core::error::{DelegateError, Result};
use delegate_core::paths::Home;

/// Handle to the global database for one home directory.
///
/// Cloning shares the verified-schema cache, so `ensure_schema` runs the
/// migration check once per process per home.
#[derive(Clone)]
pub struct Db {
    home: Home,
    verified: Arc<Mutex<Option<i64>>>,
}

impl Db {
    /// Open the database handle and bring the schema up to date.
    pub fn open(home: Home) -> Result<Self> {
        let db = Self {
            home,
            verified: Arc::new(Mutex::new(None)),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    /// A handle that defers migration until the first `ensure_schema`.
    pub fn lazy(home: Home) -> Self {
        Self {
            home,
            verified: Arc::new(Mutex::new(None)),
        }
    }

    pub fn home(&self) -> &Home {
        &self.home
    }

    /// Apply any pending migrations. Safe to call repeatedly; the check
    /// is skipped once the current version has been verified by this
    /// process.
    pub fn ensure_schema(&self) -> Result<()> {
        let mut verified = self
            .verified
            .lock()
            .map_err(|_| DelegateError::Database("schema lock poisoned".into()))?;
        let current = migrations::latest_version();
        if *verified == Some(current) {
            return Ok(());
        }
        migrations::ensure_schema(&self.home)?;
        *verified = Some(current);
        Ok(())
    }

    /// Drop the verified-schema cache (tests simulate failed upgrades).
    pub fn reset_schema_cache(&self) {
        if let Ok(mut verified) = self.verified.lock() {
            *verified = None;
        }
    }

    /// Open a fresh connection with the standard pragmas.
    pub fn conn(&self) -> Result<Connection> {
        self.ensure_schema()?;
        self.raw_conn()
    }

    /// Open a connection without the schema check (used by migrations).
    pub(crate) fn raw_conn(&self) -> Result<Connection> {
        let path = self.home.db_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)
            .map_err(|e| DelegateError::Database(format!("open {}: {e}", path.display())))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(|e| DelegateError::Database(format!("pragma: {e}")))?;
        Ok(conn)
    }
}

/// Current UTC timestamp in the stored text format.
pub fn now_ts() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Current Unix time as seconds (for `retry_after`).
pub fn now_unix() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
