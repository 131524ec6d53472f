//! Task worktree lifecycle.
//!
//! Each task+repo pair gets one shared worktree at
//! `teams/<uuid>/worktrees/<repo>/T<nnnn>/`, created off `main` on the
//! task's feature branch. All agents on the task work in that one
//! directory; concurrent access is serialized by the per-task worktree
//! lock in the telephone exchange.

use std::path::{Path, PathBuf};

use delegate_core::error::{DelegateError, Result};
use delegate_core::paths::{format_task_id, Home};
use delegate_core::types::TaskStatus;
use delegate_db::tasks::{self, TaskPatch};
use delegate_db::{ids::IdRegistry, mailbox, Db};
use delegate_workflows::WorkflowRegistry;

use crate::cmd::{git, git_in, GIT_STATUS_TIMEOUT_SECS};
use crate::envscripts::generate_env_scripts;
use crate::repo::get_repo_path;

/// Resolve the registered repo symlink to the real repo root.
fn resolve_repo(home: &Home, team_uuid: &str, repo_name: &str) -> Result<PathBuf> {
    let link = get_repo_path(home, team_uuid, repo_name);
    link.canonicalize()
        .map_err(|_| DelegateError::NotFound(format!("repo not found via {}", link.display())))
}

async fn main_head(repo: &Path) -> Result<String> {
    let out = git_in(&["rev-parse", "main"], repo, GIT_STATUS_TIMEOUT_SECS).await?;
    if !out.ok() {
        return Err(DelegateError::Git(format!(
            "rev-parse main in {}: {}",
            repo.display(),
            out.combined()
        )));
    }
    Ok(out.out())
}

/// Record main's HEAD into the task's per-repo `base_sha` map when the
/// repo has no entry yet.
async fn record_base_sha(
    db: &Db,
    team: &str,
    task_id: i64,
    repo_name: &str,
    repo: &Path,
) -> Result<()> {
    let already_recorded = {
        let conn = db.conn()?;
        let task = tasks::get_task(&conn, team, task_id)?;
        task.base_sha.contains_key(repo_name)
    };
    if already_recorded {
        return Ok(());
    }

    let sha = main_head(repo).await?;

    let conn = db.conn()?;
    let task = tasks::get_task(&conn, team, task_id)?;
    let mut base = task.base_sha.clone();
    base.insert(repo_name.to_string(), sha.clone());
    tasks::update_task(
        &conn,
        team,
        task_id,
        TaskPatch {
            base_sha: Some(base),
            ..Default::default()
        },
    )?;
    tracing::info!(
        "recorded base_sha[{}]={} for {}",
        repo_name,
        &sha[..sha.len().min(8)],
        format_task_id(task_id)
    );
    Ok(())
}

/// Create the worktree for a task+repo, with a new branch off `main`.
///
/// Idempotent: an existing worktree is returned as-is (still
/// backfilling `base_sha` when missing). Fetches best-effort before
/// branching so the base is as fresh as the network allows.
pub async fn create_task_worktree(
    db: &Db,
    home: &Home,
    team: &str,
    team_uuid: &str,
    repo_name: &str,
    task_id: i64,
    branch: Option<&str>,
) -> Result<PathBuf> {
    let repo = resolve_repo(home, team_uuid, repo_name)?;
    let wt_path = home.task_worktree_dir(team_uuid, repo_name, task_id);

    if wt_path.exists() {
        record_base_sha(db, team, task_id, repo_name, &repo).await?;
        tracing::info!("worktree already exists at {}", wt_path.display());
        return Ok(wt_path);
    }

    // Branch: explicit, else the task's own, else derived.
    let branch = match branch {
        Some(branch) => branch.to_string(),
        None => {
            let conn = db.conn()?;
            let task = tasks::get_task(&conn, team, task_id)?;
            if !task.branch.is_empty() {
                task.branch
            } else {
                format!(
                    "delegate/{}/{}/{}",
                    &team_uuid[..team_uuid.len().min(6)],
                    team,
                    format_task_id(task_id)
                )
            }
        }
    };

    if let Some(parent) = wt_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Best-effort: no-op when offline or the repo has no remote.
    let _ = git(&["fetch", "--all"], &repo).await;

    record_base_sha(db, team, task_id, repo_name, &repo).await?;

    // Defensive prune clears stale metadata that would block creation.
    let _ = git(&["worktree", "prune"], &repo).await;

    let wt_str = wt_path.display().to_string();
    let out = git(&["worktree", "add", &wt_str, "-b", &branch, "main"], &repo).await?;
    if !out.ok() {
        return Err(DelegateError::Git(format!(
            "worktree add for {}: {}",
            format_task_id(task_id),
            out.combined()
        )));
    }
    tracing::info!("created worktree at {} (branch: {})", wt_str, branch);

    if let Err(e) = generate_env_scripts(&wt_path) {
        tracing::warn!("could not generate env scripts for {}: {e}", wt_str);
    }

    Ok(wt_path)
}

/// Remove a task's worktree and prune stale metadata. Missing paths are
/// tolerated; the prune always runs so orphaned entries never block a
/// future creation.
pub async fn remove_task_worktree(
    home: &Home,
    team_uuid: &str,
    repo_name: &str,
    task_id: i64,
) -> Result<()> {
    let wt_path = home.task_worktree_dir(team_uuid, repo_name, task_id);
    let repo = resolve_repo(home, team_uuid, repo_name).ok();

    if wt_path.exists() {
        match &repo {
            Some(repo) => {
                let wt_str = wt_path.display().to_string();
                let out = git(&["worktree", "remove", &wt_str, "--force"], repo).await?;
                if !out.ok() {
                    tracing::warn!("worktree remove {}: {}", wt_str, out.combined());
                    std::fs::remove_dir_all(&wt_path).ok();
                }
            }
            None => {
                // Repo gone entirely; just drop the directory.
                std::fs::remove_dir_all(&wt_path).ok();
            }
        }
        tracing::info!("removed worktree at {}", wt_path.display());
    }

    if let Some(repo) = &repo {
        let _ = git(&["worktree", "prune"], repo).await;
    }
    Ok(())
}

/// Whether any other not-yet-done task shares `branch`. Branch deletion
/// is deferred while siblings remain.
pub fn other_unmerged_tasks_on_branch(
    conn: &rusqlite::Connection,
    team: &str,
    branch: &str,
    exclude_task_id: i64,
) -> Result<bool> {
    let all = tasks::list_tasks(conn, team, Default::default())?;
    Ok(all.iter().any(|t| {
        t.id != exclude_task_id && t.branch == branch && t.status != TaskStatus::Done
    }))
}

/// Cancel a task: set `cancelled`, remove its worktrees, and delete the
/// feature branch when no sibling task still needs it.
pub async fn cancel_task(
    db: &Db,
    ids: &IdRegistry,
    workflows: &WorkflowRegistry,
    home: &Home,
    team: &str,
    team_uuid: &str,
    task_id: i64,
) -> Result<()> {
    let (task, shared) = {
        let conn = db.conn()?;
        let task = tasks::get_task(&conn, team, task_id)?;
        tasks::change_status(&conn, workflows, team, task_id, TaskStatus::Cancelled)?;
        let shared = if task.branch.is_empty() {
            true
        } else {
            other_unmerged_tasks_on_branch(&conn, team, &task.branch, task_id)?
        };
        let _ = mailbox::log_event(
            &conn,
            ids,
            team,
            &format!("{} cancelled", format_task_id(task_id)),
            Some(task_id),
        );
        (task, shared)
    };

    for repo_name in &task.repos {
        if let Err(e) = remove_task_worktree(home, team_uuid, repo_name, task_id).await {
            tracing::warn!(
                "could not remove worktree for {} ({repo_name}): {e}",
                format_task_id(task_id)
            );
        }
        if !shared {
            if let Ok(repo) = resolve_repo(home, team_uuid, repo_name) {
                let _ = git(&["worktree", "prune"], &repo).await;
                let out = git(&["branch", "-D", &task.branch], &repo).await?;
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
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::register_repo;
    use delegate_core::types::MemberKind;
    use delegate_db::tasks::NewTask;

    /// Init a git repo with an initial commit on main.
    async fn init_repo(path: &Path) {
        std::fs::create_dir_all(path).unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test"],
        ] {
            let out = git(&args, path).await.unwrap();
            assert!(out.ok(), "git {:?}: {}", args, out.combined());
        }
        std::fs::write(path.join("README.md"), "hello\n").unwrap();
        git(&["add", "."], path).await.unwrap();
        let out = git(&["commit", "-m", "initial"], path).await.unwrap();
        assert!(out.ok(), "{}", out.combined());
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        home: Home,
        db: Db,
        ids: IdRegistry,
        team_uuid: String,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let home = Home::at(dir.path().join("home"));
        let db = Db::open(home.clone()).unwrap();
        let ids = IdRegistry::new();
        let team_uuid = {
            let conn = db.conn().unwrap();
            let uuid = ids.register_team(&conn, "alpha", None).unwrap();
            ids.register_member(&conn, MemberKind::Agent, Some(&uuid), "worker")
                .unwrap();
            uuid
        };
        let repo = dir.path().join("app");
        init_repo(&repo).await;
        register_repo(
            &home,
            "alpha",
            &team_uuid,
            repo.to_str().unwrap(),
            Some("app"),
            None,
            None,
        )
        .unwrap();
        Fixture {
            _dir: dir,
            home,
            db,
            ids,
            team_uuid,
        }
    }

    fn make_task(fx: &Fixture) -> i64 {
        let conn = fx.db.conn().unwrap();
        tasks::create_task(
            &conn,
            &fx.ids,
            "alpha",
            NewTask {
                title: "feature".into(),
                repos: vec!["app".into()],
                ..Default::default()
            },
        )
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn test_create_worktree_records_base_sha() {
        let fx = fixture().await;
        let task_id = make_task(&fx);

        let wt = create_task_worktree(&fx.db, &fx.home, "alpha", &fx.team_uuid, "app", task_id, None)
            .await
            .unwrap();
        assert!(wt.join("README.md").exists());
        assert!(wt.join(".delegate/setup.sh").exists());

        let conn = fx.db.conn().unwrap();
        let task = tasks::get_task(&conn, "alpha", task_id).unwrap();
        assert_eq!(task.base_sha["app"].len(), 40);

        // Idempotent: second call returns the same path.
        let again =
            create_task_worktree(&fx.db, &fx.home, "alpha", &fx.team_uuid, "app", task_id, None)
                .await
                .unwrap();
        assert_eq!(wt, again);
    }

    #[tokio::test]
    async fn test_concurrent_worktrees_are_independent() {
        let fx = fixture().await;
        let t1 = make_task(&fx);
        let t2 = make_task(&fx);

        let wt1 = create_task_worktree(&fx.db, &fx.home, "alpha", &fx.team_uuid, "app", t1, None)
            .await
            .unwrap();
        let wt2 = create_task_worktree(&fx.db, &fx.home, "alpha", &fx.team_uuid, "app", t2, None)
            .await
            .unwrap();
        assert_ne!(wt1, wt2);

        // Distinct branches.
        let b1 = git(&["rev-parse", "--abbrev-ref", "HEAD"], &wt1).await.unwrap();
        let b2 = git(&["rev-parse", "--abbrev-ref", "HEAD"], &wt2).await.unwrap();
        assert_ne!(b1.out(), b2.out());

        // A commit in one does not appear in the other.
        std::fs::write(wt1.join("one.txt"), "one\n").unwrap();
        git(&["add", "."], &wt1).await.unwrap();
        git(&["commit", "-m", "one"], &wt1).await.unwrap();
        assert!(!wt2.join("one.txt").exists());
        let log2 = git(&["log", "--oneline"], &wt2).await.unwrap();
        assert!(!log2.stdout.contains("one"));
    }

    #[tokio::test]
    async fn test_remove_worktree_tolerates_missing() {
        let fx = fixture().await;
        let task_id = make_task(&fx);
        // Never created: removal is a no-op.
        remove_task_worktree(&fx.home, &fx.team_uuid, "app", task_id)
            .await
            .unwrap();

        let wt = create_task_worktree(&fx.db, &fx.home, "alpha", &fx.team_uuid, "app", task_id, None)
            .await
            .unwrap();
        remove_task_worktree(&fx.home, &fx.team_uuid, "app", task_id)
            .await
            .unwrap();
        assert!(!wt.exists());
    }

    #[tokio::test]
    async fn test_cancel_removes_worktree_and_branch() {
        let fx = fixture().await;
        let task_id = make_task(&fx);
        let workflows = WorkflowRegistry::new();

        let wt = create_task_worktree(&fx.db, &fx.home, "alpha", &fx.team_uuid, "app", task_id, None)
            .await
            .unwrap();
        // Commit some work first.
        std::fs::write(wt.join("work.txt"), "wip\n").unwrap();
        git(&["add", "."], &wt).await.unwrap();
        git(&["commit", "-m", "wip"], &wt).await.unwrap();

        let branch = {
            let conn = fx.db.conn().unwrap();
            tasks::get_task(&conn, "alpha", task_id).unwrap().branch
        };

        cancel_task(
            &fx.db,
            &fx.ids,
            &workflows,
            &fx.home,
            "alpha",
            &fx.team_uuid,
            task_id,
        )
        .await
        .unwrap();

        assert!(!wt.exists());
        let conn = fx.db.conn().unwrap();
        let task = tasks::get_task(&conn, "alpha", task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);

        let repo = resolve_repo(&fx.home, &fx.team_uuid, "app").unwrap();
        let out = git(&["rev-parse", "--verify", &branch], &repo).await.unwrap();
        assert!(!out.ok(), "branch {} should be deleted", branch);
    }

    #[tokio::test]
    async fn test_cancel_keeps_branch_for_siblings() {
        let fx = fixture().await;
        let t1 = make_task(&fx);
        let t2 = make_task(&fx);
        let workflows = WorkflowRegistry::new();

        let branch = {
            let conn = fx.db.conn().unwrap();
            let branch = tasks::get_task(&conn, "alpha", t1).unwrap().branch;
            // Sibling shares the same branch explicitly.
            tasks::update_task(
                &conn,
                "alpha",
                t2,
                TaskPatch {
                    branch: Some(branch.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
            branch
        };
        create_task_worktree(&fx.db, &fx.home, "alpha", &fx.team_uuid, "app", t1, None)
            .await
            .unwrap();

        cancel_task(
            &fx.db,
            &fx.ids,
            &workflows,
            &fx.home,
            "alpha",
            &fx.team_uuid,
            t1,
        )
        .await
        .unwrap();

        // Sibling still open: branch survives.
        let repo = resolve_repo(&fx.home, &fx.team_uuid, "app").unwrap();
        let out = git(&["rev-parse", "--verify", &branch], &repo).await.unwrap();
        assert!(out.ok(), "branch {} should survive for sibling", branch);
    }
}
