//! Telephone exchange — the process-scoped registry of Telephones
//! keyed by `(team, agent)`, plus per-task worktree locks.
//!
//! The worktree lock enforces mutual exclusion between an agent's turn
//! (which may write into the task worktree) and the merge worker
//! (which runs `git reset --hard` inside it). Acquisition is bounded:
//! on timeout the merge aborts with a retryable failure instead of
//! deadlocking the daemon.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use delegate_core::error::{DelegateError, Result};

use crate::telephone::Telephone;

/// Default bound on worktree lock acquisition.
pub const WORKTREE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Writer-only lock over one task's worktrees, with timed acquisition.
#[derive(Clone, Default)]
pub struct WorktreeLock {
    inner: Arc<tokio::sync::Mutex<()>>,
}

impl WorktreeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire within `timeout`; the guard releases on drop.
    pub async fn acquire(
        &self,
        timeout: Duration,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>> {
        tokio::time::timeout(timeout, self.inner.clone().lock_owned())
            .await
            .map_err(|_| {
                DelegateError::Timeout(format!(
                    "worktree lock not acquired within {}s",
                    timeout.as_secs()
                ))
            })
    }

    /// Non-blocking attempt, for tests and opportunistic callers.
    pub fn try_acquire(&self) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        self.inner.clone().try_lock_owned().ok()
    }
}

type TelephoneRef = Arc<tokio::sync::Mutex<Telephone>>;

/// Registry of Telephones and worktree locks. One per daemon process.
#[derive(Default)]
pub struct TelephoneExchange {
    telephones: Mutex<HashMap<(String, String), TelephoneRef>>,
    locks: Mutex<HashMap<(String, i64), WorktreeLock>>,
}

impl TelephoneExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// The Telephone for `(team, agent)`, if registered.
    pub fn get(&self, team: &str, agent: &str) -> Option<TelephoneRef> {
        self.telephones
            .lock()
            .unwrap()
            .get(&(team.to_string(), agent.to_string()))
            .cloned()
    }

    /// Register a Telephone, replacing any previous one.
    pub fn put(&self, team: &str, agent: &str, telephone: Telephone) -> TelephoneRef {
        let reference = Arc::new(tokio::sync::Mutex::new(telephone));
        self.telephones.lock().unwrap().insert(
            (team.to_string(), agent.to_string()),
            reference.clone(),
        );
        reference
    }

    /// Remove and return the Telephone for `(team, agent)`.
    pub fn remove(&self, team: &str, agent: &str) -> Option<TelephoneRef> {
        self.telephones
            .lock()
            .unwrap()
            .remove(&(team.to_string(), agent.to_string()))
    }

    /// The per-task worktree lock, created on first use.
    pub fn worktree_lock(&self, team: &str, task_id: i64) -> WorktreeLock {
        self.locks
            .lock()
            .unwrap()
            .entry((team.to_string(), task_id))
            .or_default()
            .clone()
    }

    /// Drop the lock entry once a task is done; a fresh lock is minted
    /// if the id is ever reused.
    pub fn discard_worktree_lock(&self, team: &str, task_id: i64) {
        self.locks
            .lock()
            .unwrap()
            .remove(&(team.to_string(), task_id));
    }

    /// Disconnect every active subprocess. Best-effort, for shutdown.
    pub async fn close_all(&self) {
        let telephones: Vec<TelephoneRef> = {
            let mut map = self.telephones.lock().unwrap();
            map.drain().map(|(_, tel)| tel).collect()
        };
        for telephone in telephones {
            let mut telephone = telephone.lock().await;
            if let Err(e) = telephone.close().await {
                tracing::warn!("telephone close failed: {e}");
            }
        }
    }
}
