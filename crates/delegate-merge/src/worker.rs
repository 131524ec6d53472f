//! The merge sequence and its routing policy.
//!
//! `merge_task` is pure with respect to task status: it attempts
//! rebase -> agent-worktree reset -> pre-merge checks -> fast-forward
//! and returns a [`MergeResult`]; `merge_once` drives status
//! transitions, retries, and escalation.
//!
//! Invariants:
//! - All repos of a multi-repo task are rebased (or squash-reapplied)
//!   before any agent worktree is touched.
//! - The main repo's working tree is never modified during
//!   rebase/test; only a clean `main` checkout advances in lockstep
//!   via `merge --ff-only`.
//! - The agent worktree is only reset while the per-task worktree lock
//!   is held.
//! - On pre-merge failure the agent worktree stays at the rebased tip,
//!   environment intact, so the agent can fix and resubmit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use delegate_core::config::{self, ApprovalMode};
use delegate_core::error::Result;
use delegate_core::paths::{format_task_id, Home};
use delegate_core::types::{Task, TaskStatus, Verdict};
use delegate_db::tasks::{self, TaskFilter, TaskPatch};
use delegate_db::{ids::IdRegistry, mailbox, now_unix, reviews, Db};
use delegate_git::cmd::{git, git_in, git_stdin, GIT_STATUS_TIMEOUT_SECS};
use delegate_git::worktree::{other_unmerged_tasks_on_branch, remove_task_worktree};
use delegate_telephone::{TelephoneExchange, WORKTREE_LOCK_TIMEOUT};
use delegate_workflows::WorkflowRegistry;

use crate::failure::{MergeFailureReason, MergeResult};

/// Retryable failures are attempted this many times before escalating.
pub const MAX_MERGE_ATTEMPTS: i64 = 3;

/// Exponential backoff for worktree-lock contention: ~5s, ~15s, ~45s
/// with +-30% jitter, floor 5s.
const WORKTREE_RETRY_BASE: f64 = 5.0;
const WORKTREE_RETRY_JITTER: f64 = 0.3;

/// Pre-merge scripts get this long before the check fails.
const PRE_MERGE_TIMEOUT_SECS: u64 = 600;

fn worktree_retry_delay(attempt: i64) -> f64 {
    let base = WORKTREE_RETRY_BASE * 3f64.powi((attempt - 1).max(0) as i32);
    let jitter = base * WORKTREE_RETRY_JITTER * (2.0 * rand::random::<f64>() - 1.0);
    (base + jitter).max(5.0)
}

/// Derive the temp branch for a merge attempt: `_merge/<uid>` inserted
/// before the last segment of the feature branch.
fn merge_temp_branch(source_branch: &str, uid: &str) -> String {
    match source_branch.rsplit_once('/') {
        Some((head, tail)) => format!("{head}/_merge/{uid}/{tail}"),
        None => format!("_merge/{uid}/{source_branch}"),
    }
}

/// Shared handles for merge operations. One per daemon process.
pub struct MergeContext {
    pub db: Db,
    pub ids: IdRegistry,
    pub home: Home,
    pub workflows: Arc<WorkflowRegistry>,
    /// `None` skips worktree locking (tests without a daemon).
    pub exchange: Option<Arc<TelephoneExchange>>,
}

/// A disposable worktree plus its temp branch, removed after use.
struct TempWorktree {
    path: PathBuf,
    branch: String,
}

impl MergeContext {
    fn resolve_repo(&self, team_uuid: &str, repo_name: &str) -> Option<PathBuf> {
        delegate_git::repo::get_repo_path(&self.home, team_uuid, repo_name)
            .canonicalize()
            .ok()
            .filter(|p| p.is_dir())
    }

    fn log_event(&self, team: &str, text: &str, task_id: i64) {
        if let Ok(conn) = self.db.conn() {
            let _ = mailbox::log_event(&conn, &self.ids, team, text, Some(task_id));
        }
    }

    async fn remove_temp_worktree(&self, repo: &Path, wt: &TempWorktree) {
        if wt.path.exists() {
            let wt_str = wt.path.display().to_string();
            let out = git(&["worktree", "remove", &wt_str, "--force"], repo).await;
            match out {
                Ok(out) if !out.ok() => {
                    tracing::warn!("failed to remove merge worktree {}: {}", wt_str, out.stderr.trim());
                }
                Err(e) => tracing::warn!("failed to remove merge worktree {}: {e}", wt_str),
                _ => {}
            }
        }
        // Prune regardless: stale .git/worktrees entries block future
        // creation even when the directory removal failed.
        let _ = git(&["worktree", "prune"], repo).await;
        let _ = git(&["branch", "-D", &wt.branch], repo).await;

        // Collapse now-empty parents under _merge/.
        let mut parent = wt.path.parent().map(Path::to_path_buf);
        while let Some(dir) = parent {
            let name = dir.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let empty = std::fs::read_dir(&dir)
                .map(|mut d| d.next().is_none())
                .unwrap_or(false);
            if !empty {
                break;
            }
            let _ = std::fs::remove_dir(&dir);
            if name == "_merge" {
                break;
            }
            parent = dir.parent().map(Path::to_path_buf);
        }
    }

    async fn rollback_temp_worktrees(
        &self,
        repo_dirs: &BTreeMap<String, PathBuf>,
        temps: &BTreeMap<String, TempWorktree>,
    ) {
        for (repo_name, wt) in temps {
            if let Some(repo) = repo_dirs.get(repo_name) {
                self.remove_temp_worktree(repo, wt).await;
            }
        }
    }

    // ── merge_task ─────────────────────────────────────────────────

    /// Execute the full merge sequence for one task.
    pub async fn merge_task(&self, team: &str, team_uuid: &str, task_id: i64) -> MergeResult {
        let task = {
            let Ok(conn) = self.db.conn() else {
                return MergeResult::fail(task_id, MergeFailureReason::WorktreeError, "database unavailable");
            };
            match tasks::get_task(&conn, team, task_id) {
                Ok(task) => task,
                Err(e) => {
                    return MergeResult::fail(
                        task_id,
                        MergeFailureReason::WorktreeError,
                        e.to_string(),
                    )
                }
            }
        };

        if task.branch.is_empty() {
            return MergeResult::fail(
                task_id,
                MergeFailureReason::WorktreeError,
                "No branch set on task",
            );
        }
        if task.repos.is_empty() {
            return MergeResult::fail(
                task_id,
                MergeFailureReason::WorktreeError,
                "No repo set on task",
            );
        }

        let mut repo_dirs: BTreeMap<String, PathBuf> = BTreeMap::new();
        for repo_name in &task.repos {
            match self.resolve_repo(team_uuid, repo_name) {
                Some(path) => {
                    repo_dirs.insert(repo_name.clone(), path);
                }
                None => {
                    return MergeResult::fail(
                        task_id,
                        MergeFailureReason::WorktreeError,
                        format!("repo not found: {repo_name}"),
                    )
                }
            }
        }

        let attempt_num = task.merge_attempts + 1;
        self.log_event(
            team,
            &format!(
                "{} merge started ({}), attempt #{attempt_num}",
                format_task_id(task_id),
                task.branch
            ),
            task_id,
        );

        // Phase 1: rebase every repo in a disposable worktree.
        // All-or-nothing: a failure here never touches agent worktrees.
        let mut temps: BTreeMap<String, TempWorktree> = BTreeMap::new();
        let mut rebased_tips: BTreeMap<String, String> = BTreeMap::new();

        for repo_name in &task.repos {
            let repo = repo_dirs[repo_name].clone();
            match self
                .rebase_one_repo(team, team_uuid, &task, repo_name, &repo)
                .await
            {
                Ok((temp, tip)) => {
                    temps.insert(repo_name.clone(), temp);
                    rebased_tips.insert(repo_name.clone(), tip);
                }
                Err((reason, message, context)) => {
                    self.rollback_temp_worktrees(&repo_dirs, &temps).await;
                    return MergeResult::fail(task_id, reason, message)
                        .with_conflict_context(context);
                }
            }
        }

        // Phase 2: reset agent worktrees under the per-task lock.
        let mut main_heads: BTreeMap<String, String> = BTreeMap::new();
        for repo_name in &task.repos {
            let out = git_in(&["rev-parse", "main"], &repo_dirs[repo_name], GIT_STATUS_TIMEOUT_SECS)
                .await;
            main_heads.insert(
                repo_name.clone(),
                out.map(|o| if o.ok() { o.out() } else { String::new() })
                    .unwrap_or_default(),
            );
        }

        let guard = match &self.exchange {
            Some(exchange) => {
                let lock = exchange.worktree_lock(team, task_id);
                match lock.acquire(WORKTREE_LOCK_TIMEOUT).await {
                    Ok(guard) => Some(guard),
                    Err(_) => {
                        self.log_event(
                            team,
                            &format!(
                                "{} could not acquire worktree lock — aborting",
                                format_task_id(task_id)
                            ),
                            task_id,
                        );
                        self.rollback_temp_worktrees(&repo_dirs, &temps).await;
                        return MergeResult::fail(
                            task_id,
                            MergeFailureReason::WorktreeError,
                            "Could not acquire worktree lock (turn in progress?)",
                        );
                    }
                }
            }
            None => None,
        };

        let reset_result = self
            .reset_agent_worktrees(team_uuid, &task, &rebased_tips)
            .await;
        drop(guard);

        if let Err((repo_name, output)) = reset_result {
            self.rollback_temp_worktrees(&repo_dirs, &temps).await;
            self.log_event(
                team,
                &format!(
                    "{} agent worktree reset failed ({repo_name})",
                    format_task_id(task_id)
                ),
                task_id,
            );
            return MergeResult::fail(
                task_id,
                MergeFailureReason::WorktreeError,
                format!("Agent worktree reset failed in {repo_name}: {output}"),
            );
        }

        // base_sha moves to the rebase point (current main heads).
        if let Ok(conn) = self.db.conn() {
            let _ = tasks::update_task(
                &conn,
                team,
                task_id,
                TaskPatch {
                    base_sha: Some(main_heads.clone()),
                    ..Default::default()
                },
            );
        }

        // The agent worktree is now the canonical copy for testing;
        // disposable worktrees are gone before the checks run.
        self.rollback_temp_worktrees(&repo_dirs, &temps).await;
        temps.clear();

        // Phase 3: pre-merge checks inside the agent worktrees.
        for repo_name in &task.repos {
            let agent_wt = self.home.task_worktree_dir(team_uuid, repo_name, task_id);
            match run_pre_merge(&agent_wt).await {
                Ok(()) => {}
                Err(output) => {
                    self.log_event(
                        team,
                        &format!(
                            "{} merge blocked — pre-merge checks failed ({repo_name})",
                            format_task_id(task_id)
                        ),
                        task_id,
                    );
                    return MergeResult::fail(
                        task_id,
                        MergeFailureReason::PreMergeFailed,
                        format!(
                            "Pre-merge checks failed in {repo_name}: {}",
                            truncate(&output, 200)
                        ),
                    );
                }
            }
        }

        // Phase 4: fast-forward main per repo.
        let mut merge_base: BTreeMap<String, String> = BTreeMap::new();
        let mut merge_tip: BTreeMap<String, String> = BTreeMap::new();
        for repo_name in &task.repos {
            let repo = &repo_dirs[repo_name];
            let tip = &rebased_tips[repo_name];

            if let Ok(out) =
                git_in(&["rev-parse", "main"], repo, GIT_STATUS_TIMEOUT_SECS).await
            {
                if out.ok() {
                    merge_base.insert(repo_name.clone(), out.out());
                }
            }

            if let Err((reason, output)) = ff_merge_to_sha(repo, tip).await {
                self.log_event(
                    team,
                    &format!(
                        "{} merge failed ({repo_name}), attempt #{attempt_num}",
                        format_task_id(task_id)
                    ),
                    task_id,
                );
                // Record what landed so far; a later retry rebases on
                // the advanced main.
                if let Ok(conn) = self.db.conn() {
                    let _ = tasks::update_task(
                        &conn,
                        team,
                        task_id,
                        TaskPatch {
                            merge_base: Some(merge_base.clone()),
                            merge_tip: Some(merge_tip.clone()),
                            ..Default::default()
                        },
                    );
                }
                return MergeResult::fail(
                    task_id,
                    reason,
                    format!("Merge failed in {repo_name}: {}", truncate(&output, 200)),
                );
            }

            if let Ok(out) =
                git_in(&["rev-parse", "main"], repo, GIT_STATUS_TIMEOUT_SECS).await
            {
                if out.ok() {
                    merge_tip.insert(repo_name.clone(), out.out());
                }
            }
        }

        // Phase 5: record shas, mark done, clean up.
        if let Ok(conn) = self.db.conn() {
            let _ = tasks::update_task(
                &conn,
                team,
                task_id,
                TaskPatch {
                    merge_base: Some(merge_base),
                    merge_tip: Some(merge_tip),
                    ..Default::default()
                },
            );
            self.log_event(
                team,
                &format!("{} merged to main \u{2713}", format_task_id(task_id)),
                task_id,
            );
            if let Err(e) =
                tasks::change_status(&conn, &self.workflows, team, task_id, TaskStatus::Done)
            {
                tracing::warn!("{}: could not mark done: {e}", format_task_id(task_id));
            }
        }

        self.cleanup_after_merge(team, team_uuid, &task, &repo_dirs).await;

        if let Some(exchange) = &self.exchange {
            exchange.discard_worktree_lock(team, task_id);
        }

        MergeResult::ok(task_id, "Merged successfully")
    }

    /// Phase-1 body for one repo: temp worktree, rebase, squash
    /// fallback. Returns the surviving temp worktree and rebased tip.
    async fn rebase_one_repo(
        &self,
        team: &str,
        team_uuid: &str,
        task: &Task,
        repo_name: &str,
        repo: &Path,
    ) -> std::result::Result<(TempWorktree, String), (MergeFailureReason, String, String)> {
        let task_id = task.id;
        let uid = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let wt_path = self.home.merge_worktree_dir(team_uuid, &uid, task_id);
        let temp_branch = merge_temp_branch(&task.branch, &uid);

        if let Some(parent) = wt_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let wt_str = wt_path.display().to_string();
        let created = git(
            &["worktree", "add", "-b", &temp_branch, &wt_str, &task.branch],
            repo,
        )
        .await;
        match created {
            Ok(out) if out.ok() => {}
            Ok(out) => {
                return Err((
                    MergeFailureReason::WorktreeError,
                    format!("Could not create merge worktree: {}", out.stderr.trim()),
                    String::new(),
                ))
            }
            Err(e) => {
                return Err((
                    MergeFailureReason::WorktreeError,
                    format!("Could not create merge worktree: {e}"),
                    String::new(),
                ))
            }
        }
        let mut temp = TempWorktree {
            path: wt_path,
            branch: temp_branch,
        };

        // Rebase the temp branch onto main. With a recorded base_sha,
        // only the commits after it are replayed.
        let base_sha = task.base_sha.get(repo_name).cloned().unwrap_or_default();
        let rebase_ok = {
            let out = if base_sha.is_empty() {
                git(&["rebase", "main"], &temp.path).await
            } else {
                git(&["rebase", "--onto", "main", &base_sha], &temp.path).await
            };
            match out {
                Ok(out) if out.ok() => true,
                Ok(_) => {
                    let _ = git(&["rebase", "--abort"], &temp.path).await;
                    false
                }
                Err(_) => {
                    let _ = git(&["rebase", "--abort"], &temp.path).await;
                    false
                }
            }
        };

        if !rebase_ok {
            self.remove_temp_worktree(repo, &temp).await;
            self.log_event(
                team,
                &format!(
                    "{} rebase conflict in {repo_name}, trying squash-reapply fallback",
                    format_task_id(task_id)
                ),
                task_id,
            );
            tracing::info!(
                "{}: rebase failed for {repo_name}, attempting squash-reapply",
                format_task_id(task_id)
            );

            // Squash-reapply: a fresh worktree at main, the feature's
            // net diff applied as one commit.
            let squash_uid = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
            let squash_path = self.home.merge_worktree_dir(team_uuid, &squash_uid, task_id);
            let squash_branch =
                format!("_merge/{squash_uid}/squash-{}", format_task_id(task_id));
            if let Some(parent) = squash_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let squash_str = squash_path.display().to_string();
            let created = git(
                &["worktree", "add", "-b", &squash_branch, &squash_str, "main"],
                repo,
            )
            .await;
            let created_ok = matches!(&created, Ok(out) if out.ok());
            if !created_ok {
                let stderr = created.map(|o| o.stderr).unwrap_or_default();
                self.log_event(
                    team,
                    &format!(
                        "{} squash-reapply worktree creation failed ({repo_name})",
                        format_task_id(task_id)
                    ),
                    task_id,
                );
                return Err((
                    MergeFailureReason::RebaseConflict,
                    format!(
                        "Rebase conflict in {repo_name} and could not create squash worktree: {}",
                        truncate(&stderr, 200)
                    ),
                    String::new(),
                ));
            }
            let squash = TempWorktree {
                path: squash_path,
                branch: squash_branch,
            };

            match squash_reapply(repo, &task.branch, &squash.path).await {
                Ok(()) => {
                    self.log_event(
                        team,
                        &format!(
                            "{} squash-reapply succeeded for {repo_name}",
                            format_task_id(task_id)
                        ),
                        task_id,
                    );
                    tracing::info!(
                        "{}: squash-reapply succeeded for {repo_name}",
                        format_task_id(task_id)
                    );
                    temp = squash;
                }
                Err(output) => {
                    self.remove_temp_worktree(repo, &squash).await;
                    let context = capture_conflict_files(repo, &task.branch, &base_sha).await;
                    self.log_event(
                        team,
                        &format!(
                            "{} true content conflict in {repo_name}, squash-reapply also failed",
                            format_task_id(task_id)
                        ),
                        task_id,
                    );
                    return Err((
                        MergeFailureReason::SquashConflict,
                        format!(
                            "True content conflict in {repo_name}: {}",
                            truncate(&output, 200)
                        ),
                        context,
                    ));
                }
            }
        }

        let tip = git_in(&["rev-parse", "HEAD"], &temp.path, GIT_STATUS_TIMEOUT_SECS).await;
        match tip {
            Ok(out) if out.ok() => Ok((temp, out.out())),
            other => {
                let detail = match other {
                    Ok(out) => out.combined(),
                    Err(e) => e.to_string(),
                };
                self.remove_temp_worktree(repo, &temp).await;
                Err((
                    MergeFailureReason::WorktreeError,
                    format!("Could not determine rebased tip in {repo_name}: {detail}"),
                    String::new(),
                ))
            }
        }
    }

    /// Phase-2 body: reset each agent worktree to its rebased tip,
    /// rolling back already-reset worktrees on failure.
    async fn reset_agent_worktrees(
        &self,
        team_uuid: &str,
        task: &Task,
        rebased_tips: &BTreeMap<String, String>,
    ) -> std::result::Result<(), (String, String)> {
        let mut reset_done: Vec<(String, String)> = Vec::new();

        for repo_name in &task.repos {
            let tip = &rebased_tips[repo_name];
            let agent_wt = self.home.task_worktree_dir(team_uuid, repo_name, task.id);
            if !agent_wt.is_dir() {
                // No agent worktree (tests advance state without infra)
                // — nothing to reset.
                tracing::debug!(
                    "agent worktree not found at {} — skipping reset",
                    agent_wt.display()
                );
                continue;
            }

            let old_head = git_in(&["rev-parse", "HEAD"], &agent_wt, GIT_STATUS_TIMEOUT_SECS)
                .await
                .map(|o| if o.ok() { o.out() } else { String::new() })
                .unwrap_or_default();

            // reset --hard moves the branch ref and tracked files;
            // untracked env artifacts survive.
            let out = git(&["reset", "--hard", tip], &agent_wt).await;
            let ok = matches!(&out, Ok(out) if out.ok());
            if !ok {
                let detail = out
                    .map(|o| o.stderr.trim().to_string())
                    .unwrap_or_else(|e| e.to_string());
                for (done_repo, done_head) in &reset_done {
                    if done_head.is_empty() {
                        continue;
                    }
                    let wt = self.home.task_worktree_dir(team_uuid, done_repo, task.id);
                    let _ = git(&["reset", "--hard", done_head], &wt).await;
                }
                return Err((repo_name.clone(), format!("git reset --hard failed: {detail}")));
            }
            reset_done.push((repo_name.clone(), old_head));
        }
        Ok(())
    }

    /// Phase-5 cleanup: remove the agent worktree and delete the
    /// feature branch unless a sibling task still shares it.
    async fn cleanup_after_merge(
        &self,
        team: &str,
        team_uuid: &str,
        task: &Task,
        repo_dirs: &BTreeMap<String, PathBuf>,
    ) {
        let shared = self
            .db
            .conn()
            .ok()
            .and_then(|conn| {
                other_unmerged_tasks_on_branch(&conn, team, &task.branch, task.id).ok()
            })
            .unwrap_or(false);
        if shared {
            tracing::info!(
                "skipping branch deletion for {} — other unmerged tasks share branch {}",
                format_task_id(task.id),
                task.branch
            );
            return;
        }

        for repo_name in &task.repos {
            if let Err(e) = remove_task_worktree(&self.home, team_uuid, repo_name, task.id).await {
                tracing::warn!(
                    "could not remove agent worktree for {} ({repo_name}): {e}",
                    format_task_id(task.id)
                );
            }
            let repo = &repo_dirs[repo_name];
            let _ = git(&["worktree", "prune"], repo).await;
            // -D because the rebase rewrote the SHAs; -d would refuse.
            let out = git(&["branch", "-D", &task.branch], repo).await;
            if let Ok(out) = out {
                if !out.ok() {
                    tracing::warn!(
                        "failed to delete branch {} in {repo_name}: {}",
                        task.branch,
                        out.stderr.trim()
                    );
                }
            }
        }
    }

    // ── merge_once ─────────────────────────────────────────────────

    /// One scan of the team's mergeable tasks: newly approved tasks in
    /// `in_approval`, then `merging` continuations whose `retry_after`
    /// has expired.
    pub async fn merge_once(&self, team: &str, team_uuid: &str) -> Result<Vec<MergeResult>> {
        let mut results = Vec::new();
        let manager = self.manager_name(team_uuid);
        let mut processed: Vec<i64> = Vec::new();

        // 1. Newly approved tasks.
        let approved: Vec<Task> = {
            let conn = self.db.conn()?;
            let candidates = tasks::list_tasks(
                &conn,
                team,
                TaskFilter {
                    status: Some(TaskStatus::InApproval),
                    ..Default::default()
                },
            )?;
            let mut ready = Vec::new();
            for task in candidates {
                if task.repos.is_empty() {
                    continue;
                }
                let approval = config::repo_approval(&self.home, team, &task.repos[0]);
                let go = match approval {
                    ApprovalMode::Auto => true,
                    ApprovalMode::Manual => {
                        let review = reviews::get_current_review(&conn, team, task.id)?;
                        let verdict = review.as_ref().and_then(|r| r.verdict);
                        if verdict == Some(Verdict::Approved) {
                            true
                        } else {
                            tracing::debug!(
                                "{}: needs human approval (verdict={verdict:?})",
                                format_task_id(task.id)
                            );
                            false
                        }
                    }
                };
                if go {
                    ready.push(task);
                }
            }
            ready
        };

        for task in approved {
            {
                let conn = self.db.conn()?;
                tasks::transition_task(
                    &conn,
                    &self.workflows,
                    team,
                    task.id,
                    TaskStatus::Merging,
                    &manager,
                )?;
            }
            let result = self.merge_task(team, team_uuid, task.id).await;
            processed.push(task.id);
            if !result.success {
                self.handle_merge_failure(team, task.id, &result, &manager);
            }
            results.push(result);
        }

        // 2. merging continuations / retries.
        let merging: Vec<Task> = {
            let conn = self.db.conn()?;
            tasks::list_tasks(
                &conn,
                team,
                TaskFilter {
                    status: Some(TaskStatus::Merging),
                    ..Default::default()
                },
            )?
        };
        for task in merging {
            if processed.contains(&task.id) {
                continue;
            }
            if let Some(retry_after) = task.retry_after {
                if now_unix() < retry_after {
                    tracing::debug!(
                        "{}: retry_after in {:.0}s — skipping",
                        format_task_id(task.id),
                        retry_after - now_unix()
                    );
                    continue;
                }
                // Clear the stale gate before attempting.
                let conn = self.db.conn()?;
                tasks::update_task(
                    &conn,
                    team,
                    task.id,
                    TaskPatch {
                        retry_after: Some(None),
                        ..Default::default()
                    },
                )?;
            }

            tracing::info!(
                "{}: {} merge (attempt {}/{})",
                format_task_id(task.id),
                if task.merge_attempts > 0 { "retrying" } else { "starting" },
                task.merge_attempts + 1,
                MAX_MERGE_ATTEMPTS
            );
            let result = self.merge_task(team, team_uuid, task.id).await;
            if !result.success {
                self.handle_merge_failure(team, task.id, &result, &manager);
            }
            results.push(result);
        }

        Ok(results)
    }

    /// Route a merge failure: retryables stay in `merging` (worktree
    /// contention with backoff); non-retryables, or exhausted retries,
    /// escalate to `merge_failed` + manager notification.
    fn handle_merge_failure(&self, team: &str, task_id: i64, result: &MergeResult, manager: &str) {
        let reason = result.reason.unwrap_or(MergeFailureReason::WorktreeError);
        let detail = reason.short_message().to_string();
        let Ok(conn) = self.db.conn() else {
            return;
        };
        let Ok(task) = tasks::get_task(&conn, team, task_id) else {
            return;
        };

        if reason.retryable() {
            let attempts = task.merge_attempts + 1;
            let mut patch = TaskPatch {
                merge_attempts: Some(attempts),
                status_detail: Some(detail.clone()),
                ..Default::default()
            };
            if attempts < MAX_MERGE_ATTEMPTS {
                if reason == MergeFailureReason::WorktreeError {
                    let delay = worktree_retry_delay(attempts);
                    patch.retry_after = Some(Some(now_unix() + delay));
                    tracing::info!(
                        "{}: WORKTREE_ERROR, retry in {delay:.0}s (attempt {attempts}/{MAX_MERGE_ATTEMPTS})",
                        format_task_id(task_id)
                    );
                } else {
                    tracing::info!(
                        "{}: retryable failure ({}), attempt {attempts}/{MAX_MERGE_ATTEMPTS} — will retry",
                        format_task_id(task_id),
                        reason.name()
                    );
                }
                let _ = tasks::update_task(&conn, team, task_id, patch);
                return;
            }
            let _ = tasks::update_task(&conn, team, task_id, patch);
            tracing::warn!(
                "{}: retryable failure ({}) but max attempts ({MAX_MERGE_ATTEMPTS}) reached — escalating",
                format_task_id(task_id),
                reason.name()
            );
        }

        let _ = tasks::update_task(
            &conn,
            team,
            task_id,
            TaskPatch {
                status_detail: Some(detail.clone()),
                ..Default::default()
            },
        );
        if let Err(e) = tasks::transition_task(
            &conn,
            &self.workflows,
            team,
            task_id,
            TaskStatus::MergeFailed,
            manager,
        ) {
            tracing::error!("{}: escalation failed: {e}", format_task_id(task_id));
        }

        // Conflict notification to the manager, with the truncated
        // output and any conflict context from squash-reapply.
        let mut body = format!(
            "Merge of {} failed: {detail}\n\n{}",
            format_task_id(task_id),
            truncate(&result.message, 500)
        );
        if !result.conflict_context.is_empty() {
            body.push_str(&format!("\n\n{}", result.conflict_context));
        }
        let _ = mailbox::send(&conn, &self.ids, team, "system", manager, &body, Some(task_id));
    }

    /// The manager agent's name; escalations fall back to a stub
    /// recipient when no manager exists (bootstrap gap).
    fn manager_name(&self, team_uuid: &str) -> String {
        config::find_manager(&self.home, team_uuid).unwrap_or_else(|| "delegate".to_string())
    }
}

// ── Free helpers ───────────────────────────────────────────────────

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

/// Apply the feature's net diff (`main...branch`) onto main as one
/// squashed commit inside the worktree at `wt` (checked out at main).
async fn squash_reapply(
    repo: &Path,
    branch: &str,
    wt: &Path,
) -> std::result::Result<(), String> {
    let range = format!("main...{branch}");
    let diff = git(&["diff", &range], repo)
        .await
        .map_err(|e| format!("Could not compute diff: {e}"))?;
    if !diff.ok() {
        return Err(format!("Could not compute diff: {}", diff.stderr));
    }
    let patch = diff.stdout;
    if patch.trim().is_empty() {
        // Branch already at main; nothing to apply.
        return Ok(());
    }

    let applied = git_stdin(&["apply", "--index", "--3way"], wt, &patch)
        .await
        .map_err(|e| e.to_string())?;
    if !applied.ok() {
        return Err(applied.combined());
    }

    let message = format!("squash-reapply: apply {branch} onto main");
    let committed = git(&["commit", "-m", &message], wt)
        .await
        .map_err(|e| e.to_string())?;
    if !committed.ok() {
        return Err(format!("Commit after apply failed: {}", committed.stderr));
    }
    Ok(())
}

/// Files touched on both main and the feature since the merge base —
/// the human-readable conflict context for the escalation message.
async fn capture_conflict_files(repo: &Path, branch: &str, base_sha: &str) -> String {
    let mut merge_base = if base_sha.is_empty() {
        "main".to_string()
    } else {
        base_sha.to_string()
    };
    if let Ok(out) = git(&["merge-base", "main", branch], repo).await {
        if out.ok() {
            merge_base = out.out();
        }
    }

    let files_changed = |out: Option<delegate_git::GitOutput>| -> Vec<String> {
        out.filter(|o| o.ok())
            .map(|o| {
                o.stdout
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let main_range = format!("{merge_base}..main");
    let branch_range = format!("{merge_base}..{branch}");
    let main_files = files_changed(git(&["diff", "--name-only", &main_range], repo).await.ok());
    let branch_files =
        files_changed(git(&["diff", "--name-only", &branch_range], repo).await.ok());

    let mut overlap: Vec<&String> = main_files
        .iter()
        .filter(|f| branch_files.contains(f))
        .collect();
    overlap.sort();
    if overlap.is_empty() {
        return "Could not identify specific conflicting files.".to_string();
    }

    let mut parts = vec![format!("Conflicting files ({}):", overlap.len())];
    for file in overlap.iter().take(10) {
        parts.push(format!("  - {file}"));
    }
    if overlap.len() > 10 {
        parts.push(format!("  ... and {} more files", overlap.len() - 10));
    }
    parts.join("\n")
}

/// Run `.delegate/setup.sh` then `.delegate/premerge.sh` (sourced, so
/// env mutations carry over) inside the agent worktree. A missing
/// premerge script is a pass.
async fn run_pre_merge(wt: &Path) -> std::result::Result<(), String> {
    let setup = wt.join(".delegate/setup.sh");
    let premerge = wt.join(".delegate/premerge.sh");

    if !premerge.exists() {
        tracing::warn!(
            "{}: .delegate/premerge.sh not found — skipping pre-merge checks",
            wt.display()
        );
        return Ok(());
    }

    let mut shell_cmd = String::new();
    if setup.exists() {
        shell_cmd.push_str(". ./.delegate/setup.sh && ");
    } else {
        tracing::warn!("{}: .delegate/setup.sh not found — skipping env setup", wt.display());
    }
    shell_cmd.push_str(". ./.delegate/premerge.sh");

    let fut = tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(&shell_cmd)
        .current_dir(wt)
        .stdin(std::process::Stdio::null())
        .output();
    let output = tokio::time::timeout(Duration::from_secs(PRE_MERGE_TIMEOUT_SECS), fut)
        .await
        .map_err(|_| {
            format!(".delegate/premerge.sh timed out after {PRE_MERGE_TIMEOUT_SECS} seconds.")
        })?
        .map_err(|e| format!("Pre-merge script failed to start: {e}"))?;

    if !output.status.success() {
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let lines: Vec<&str> = combined.lines().collect();
        let tail = if lines.len() > 50 {
            lines[lines.len() - 50..].join("\n")
        } else {
            combined.clone()
        };
        return Err(format!(
            ".delegate/premerge.sh exited {}:\n{tail}",
            output.status.code().unwrap_or(-1)
        ));
    }
    Ok(())
}

/// Fast-forward `main` to a specific commit SHA.
///
/// Behaviour depends on the user's checkout in the main repo:
/// - `main` checked out + dirty: fail (protect uncommitted work).
/// - `main` checked out + clean: `merge --ff-only` (ref + working
///   tree advance together, no phantom dirty files).
/// - another branch checked out: `update-ref` with the captured old
///   SHA as an atomic compare-and-swap; the user's tree is untouched.
async fn ff_merge_to_sha(
    repo: &Path,
    tip: &str,
) -> std::result::Result<(), (MergeFailureReason, String)> {
    let exists = git_in(&["cat-file", "-e", tip], repo, GIT_STATUS_TIMEOUT_SECS)
        .await
        .map_err(|e| (MergeFailureReason::FfNotPossible, e.to_string()))?;
    if !exists.ok() {
        return Err((
            MergeFailureReason::FfNotPossible,
            format!("Commit not found: {tip}"),
        ));
    }

    let ancestor = git_in(
        &["merge-base", "--is-ancestor", "main", tip],
        repo,
        GIT_STATUS_TIMEOUT_SECS,
    )
    .await
    .map_err(|e| (MergeFailureReason::FfNotPossible, e.to_string()))?;
    if !ancestor.ok() {
        return Err((
            MergeFailureReason::FfNotPossible,
            format!(
                "Fast-forward not possible: {} is not a descendant of main",
                &tip[..tip.len().min(12)]
            ),
        ));
    }

    let head = git_in(
        &["rev-parse", "--abbrev-ref", "HEAD"],
        repo,
        GIT_STATUS_TIMEOUT_SECS,
    )
    .await
    .map_err(|e| (MergeFailureReason::FfNotPossible, e.to_string()))?;
    let user_branch = if head.ok() { head.out() } else { String::new() };

    if user_branch == "main" {
        let status = git_in(&["status", "--porcelain"], repo, GIT_STATUS_TIMEOUT_SECS)
            .await
            .map_err(|e| (MergeFailureReason::DirtyMain, e.to_string()))?;
        let dirty = status.stdout.trim().to_string();
        if !dirty.is_empty() {
            return Err((
                MergeFailureReason::DirtyMain,
                format!(
                    "Main repo has uncommitted changes on main — commit or stash them before merging.\nDirty files:\n{}",
                    truncate(&dirty, 500)
                ),
            ));
        }
        let merged = git(&["merge", "--ff-only", tip], repo)
            .await
            .map_err(|e| (MergeFailureReason::FfNotPossible, e.to_string()))?;
        if !merged.ok() {
            return Err((
                MergeFailureReason::FfNotPossible,
                format!("Fast-forward merge failed: {}", merged.stderr),
            ));
        }
        Ok(())
    } else {
        let main_tip = git_in(&["rev-parse", "main"], repo, GIT_STATUS_TIMEOUT_SECS)
            .await
            .map_err(|e| (MergeFailureReason::FfNotPossible, e.to_string()))?;
        if !main_tip.ok() {
            return Err((
                MergeFailureReason::FfNotPossible,
                format!("Could not resolve main: {}", main_tip.stderr),
            ));
        }
        let old = main_tip.out();
        let updated = git(&["update-ref", "refs/heads/main", tip, &old], repo)
            .await
            .map_err(|e| (MergeFailureReason::UpdateRefFailed, e.to_string()))?;
        if !updated.ok() {
            return Err((
                MergeFailureReason::UpdateRefFailed,
                format!("Atomic update-ref failed (concurrent push?): {}", updated.stderr),
            ));
        }
        Ok(())
    }
}
