//! End-to-end merge scenarios against real git repositories.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use delegate_core::config::ApprovalMode;
use delegate_core::paths::Home;
use delegate_core::types::{MemberKind, TaskStatus, Verdict};
use delegate_db::tasks::{self, NewTask, TaskPatch};
use delegate_db::{ids::IdRegistry, mailbox, now_unix, reviews, Db};
use delegate_git::cmd::git;
use delegate_git::repo::register_repo;
use delegate_git::worktree::create_task_worktree;
use delegate_merge::{MergeContext, MergeFailureReason};
use delegate_workflows::WorkflowRegistry;

const TEAM: &str = "alpha";

async fn run_git(args: &[&str], cwd: &Path) {
    let out = git(args, cwd).await.unwrap();
    assert!(out.ok(), "git {args:?} in {}: {}", cwd.display(), out.combined());
}

async fn init_repo(path: &Path) {
    std::fs::create_dir_all(path).unwrap();
    run_git(&["init", "-b", "main"], path).await;
    run_git(&["config", "user.email", "test@example.com"], path).await;
    run_git(&["config", "user.name", "Test"], path).await;
    std::fs::write(path.join("README.md"), "hello\n").unwrap();
    run_git(&["add", "."], path).await;
    run_git(&["commit", "-m", "initial"], path).await;
}

async fn commit_file(repo: &Path, name: &str, content: &str, message: &str) {
    std::fs::write(repo.join(name), content).unwrap();
    run_git(&["add", "."], repo).await;
    run_git(&["commit", "-m", message], repo).await;
}

async fn rev_parse(repo: &Path, rev: &str) -> String {
    git(&["rev-parse", rev], repo).await.unwrap().out()
}

struct Fixture {
    _dir: tempfile::TempDir,
    home: Home,
    db: Db,
    ids: IdRegistry,
    workflows: Arc<WorkflowRegistry>,
    ctx: MergeContext,
    team_uuid: String,
    repos_root: PathBuf,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let home = Home::at(dir.path().join("home"));
    let db = Db::open(home.clone()).unwrap();
    let ids = IdRegistry::new();
    let workflows = Arc::new(WorkflowRegistry::new());

    let team_uuid = {
        let conn = db.conn().unwrap();
        let uuid = ids.register_team(&conn, TEAM, None).unwrap();
        ids.register_member(&conn, MemberKind::Agent, Some(&uuid), "lead")
            .unwrap();
        ids.register_member(&conn, MemberKind::Agent, Some(&uuid), "worker")
            .unwrap();
        uuid
    };
    for (agent, role) in [("lead", "manager"), ("worker", "engineer")] {
        let agent_dir = home.agent_dir(&team_uuid, agent);
        std::fs::create_dir_all(&agent_dir).unwrap();
        std::fs::write(
            home.agent_state_path(&team_uuid, agent),
            format!("role: {role}\n"),
        )
        .unwrap();
    }

    let ctx = MergeContext {
        db: db.clone(),
        ids: ids.clone(),
        home: home.clone(),
        workflows: workflows.clone(),
        exchange: None,
    };
    Fixture {
        repos_root: dir.path().to_path_buf(),
        _dir: dir,
        home,
        db,
        ids,
        workflows,
        ctx,
        team_uuid,
    }
}

impl Fixture {
    async fn add_repo(&self, name: &str, approval: ApprovalMode) -> PathBuf {
        let repo = self.repos_root.join(name);
        init_repo(&repo).await;
        register_repo(
            &self.home,
            TEAM,
            &self.team_uuid,
            repo.to_str().unwrap(),
            Some(name),
            Some(approval),
            None,
        )
        .unwrap();
        repo
    }

    /// Create a task on `repos`, create its worktrees, and commit one
    /// feature file per repo on the feature branch.
    async fn feature_task(&self, repos: &[&str], file_prefix: &str) -> i64 {
        let task = {
            let conn = self.db.conn().unwrap();
            tasks::create_task(
                &conn,
                &self.ids,
                TEAM,
                NewTask {
                    title: format!("add {file_prefix}"),
                    assignee: "worker".into(),
                    repos: repos.iter().map(|s| s.to_string()).collect(),
                    ..Default::default()
                },
            )
            .unwrap()
        };
        for repo_name in repos {
            let wt = create_task_worktree(
                &self.db,
                &self.home,
                TEAM,
                &self.team_uuid,
                repo_name,
                task.id,
                None,
            )
            .await
            .unwrap();
            commit_file(
                &wt,
                &format!("{file_prefix}.py"),
                "print('feature')\n",
                &format!("Add {file_prefix}.py"),
            )
            .await;
        }
        task.id
    }

    fn advance_to_merging(&self, task_id: i64) {
        let conn = self.db.conn().unwrap();
        for status in [
            TaskStatus::InProgress,
            TaskStatus::InReview,
            TaskStatus::InApproval,
        ] {
            tasks::change_status(&conn, &self.workflows, TEAM, task_id, status).unwrap();
        }
        tasks::transition_task(&conn, &self.workflows, TEAM, task_id, TaskStatus::Merging, "lead")
            .unwrap();
    }

    fn advance_to_approval(&self, task_id: i64) {
        let conn = self.db.conn().unwrap();
        for status in [
            TaskStatus::InProgress,
            TaskStatus::InReview,
            TaskStatus::InApproval,
        ] {
            tasks::change_status(&conn, &self.workflows, TEAM, task_id, status).unwrap();
        }
    }

    fn task(&self, task_id: i64) -> delegate_core::types::Task {
        let conn = self.db.conn().unwrap();
        tasks::get_task(&conn, TEAM, task_id).unwrap()
    }
}

fn merge_dir_is_empty(home: &Home, team_uuid: &str) -> bool {
    let merge_dir = home.worktrees_dir(team_uuid).join("_merge");
    !merge_dir.exists()
        || std::fs::read_dir(&merge_dir)
            .map(|mut d| d.next().is_none())
            .unwrap_or(true)
}

#[tokio::test]
async fn s1_happy_path_single_repo_merge() {
    let fx = fixture().await;
    let repo = fx.add_repo("myrepo", ApprovalMode::Auto).await;
    let task_id = fx.feature_task(&["myrepo"], "feature").await;
    fx.advance_to_merging(task_id);

    let result = fx.ctx.merge_task(TEAM, &fx.team_uuid, task_id).await;
    assert!(result.success, "merge failed: {result}");

    // main contains the feature commit.
    run_git(&["checkout", "main"], &repo).await;
    assert!(repo.join("feature.py").exists());
    let log = git(&["log", "--oneline"], &repo).await.unwrap();
    assert!(log.stdout.contains("Add feature.py"));

    // Agent worktree removed; feature branch deleted; task done.
    let task = fx.task(task_id);
    assert_eq!(task.status, TaskStatus::Done);
    assert!(!task.completed_at.is_empty());
    assert!(!fx
        .home
        .task_worktree_dir(&fx.team_uuid, "myrepo", task_id)
        .exists());
    let branch_check = git(&["rev-parse", "--verify", &task.branch], &repo).await.unwrap();
    assert!(!branch_check.ok(), "feature branch should be deleted");

    // merge_base/merge_tip recorded and main advanced to merge_tip.
    assert_eq!(task.merge_tip["myrepo"], rev_parse(&repo, "main").await);
    assert_ne!(task.merge_base["myrepo"], task.merge_tip["myrepo"]);
    assert!(merge_dir_is_empty(&fx.home, &fx.team_uuid));
}

#[tokio::test]
async fn s2_sequential_merges_linear_history() {
    let fx = fixture().await;
    let repo = fx.add_repo("myrepo", ApprovalMode::Auto).await;

    let t1 = fx.feature_task(&["myrepo"], "feature1").await;
    let t2 = fx.feature_task(&["myrepo"], "feature2").await;

    fx.advance_to_merging(t1);
    let r1 = fx.ctx.merge_task(TEAM, &fx.team_uuid, t1).await;
    assert!(r1.success, "{r1}");

    // T2 must rebase onto T1's new main.
    fx.advance_to_merging(t2);
    let r2 = fx.ctx.merge_task(TEAM, &fx.team_uuid, t2).await;
    assert!(r2.success, "{r2}");

    run_git(&["checkout", "main"], &repo).await;
    assert!(repo.join("feature1.py").exists());
    assert!(repo.join("feature2.py").exists());

    // Linear history: no merge commits.
    let merges = git(&["log", "--merges", "--oneline"], &repo).await.unwrap();
    assert!(merges.stdout.trim().is_empty(), "history should be linear");
    assert_eq!(fx.task(t1).status, TaskStatus::Done);
    assert_eq!(fx.task(t2).status, TaskStatus::Done);
}

#[tokio::test]
async fn s3_true_conflict_leaves_everything_intact() {
    let fx = fixture().await;
    let repo = fx.add_repo("myrepo", ApprovalMode::Auto).await;

    let task_id = {
        let task = fx.feature_task(&["myrepo"], "unused").await;
        // Overwrite the same file on both sides, same lines.
        let wt = fx.home.task_worktree_dir(&fx.team_uuid, "myrepo", task);
        commit_file(&wt, "conflict.txt", "feature version\n", "feature side").await;
        commit_file(&repo, "conflict.txt", "main version\n", "conflicting change on main").await;
        task
    };
    let pre_main = rev_parse(&repo, "main").await;
    let branch = fx.task(task_id).branch.clone();
    let pre_branch = rev_parse(&repo, &branch).await;

    fx.advance_to_merging(task_id);
    let result = fx.ctx.merge_task(TEAM, &fx.team_uuid, task_id).await;

    assert!(!result.success);
    let reason = result.reason.unwrap();
    assert!(
        matches!(
            reason,
            MergeFailureReason::RebaseConflict | MergeFailureReason::SquashConflict
        ),
        "expected a conflict reason, got {}",
        reason.name()
    );
    assert!(!result.retryable());

    // main and the feature branch sit at their pre-merge SHAs.
    assert_eq!(rev_parse(&repo, "main").await, pre_main);
    assert_eq!(rev_parse(&repo, &branch).await, pre_branch);
    // All disposable worktrees removed.
    assert!(merge_dir_is_empty(&fx.home, &fx.team_uuid));
    // Squash-conflict context names the overlapping file.
    if reason == MergeFailureReason::SquashConflict {
        assert!(result.conflict_context.contains("conflict.txt"));
    }
}

#[tokio::test]
async fn s4_dirty_main_protects_user_changes() {
    let fx = fixture().await;
    let repo = fx.add_repo("myrepo", ApprovalMode::Auto).await;
    let task_id = fx.feature_task(&["myrepo"], "feature").await;

    // User has uncommitted changes while on main.
    std::fs::write(repo.join("README.md"), "uncommitted local edits\n").unwrap();
    let pre_main = rev_parse(&repo, "main").await;

    fx.advance_to_merging(task_id);
    let result = fx.ctx.merge_task(TEAM, &fx.team_uuid, task_id).await;

    assert!(!result.success);
    assert_eq!(result.reason, Some(MergeFailureReason::DirtyMain));
    assert!(result.retryable());

    // The user's file is byte-identical and main's ref unchanged.
    assert_eq!(
        std::fs::read_to_string(repo.join("README.md")).unwrap(),
        "uncommitted local edits\n"
    );
    assert_eq!(rev_parse(&repo, "main").await, pre_main);
}

#[tokio::test]
async fn user_on_another_branch_gets_ref_only_update() {
    let fx = fixture().await;
    let repo = fx.add_repo("myrepo", ApprovalMode::Auto).await;
    let task_id = fx.feature_task(&["myrepo"], "feature").await;

    // The user is working on an unrelated branch with local edits.
    run_git(&["checkout", "-b", "local-work"], &repo).await;
    std::fs::write(repo.join("scratchpad.txt"), "wip notes\n").unwrap();
    let pre_main = rev_parse(&repo, "main").await;

    fx.advance_to_merging(task_id);
    let result = fx.ctx.merge_task(TEAM, &fx.team_uuid, task_id).await;
    assert!(result.success, "{result}");

    // main's ref advanced via the atomic CAS; the user's checkout and
    // working tree are untouched.
    assert_ne!(rev_parse(&repo, "main").await, pre_main);
    let head = git(&["rev-parse", "--abbrev-ref", "HEAD"], &repo)
        .await
        .unwrap()
        .out();
    assert_eq!(head, "local-work");
    assert_eq!(
        std::fs::read_to_string(repo.join("scratchpad.txt")).unwrap(),
        "wip notes\n"
    );
    // The feature file is on main but not in the user's tree.
    assert!(!repo.join("feature.py").exists());
    let show = git(&["show", "main:feature.py"], &repo).await.unwrap();
    assert!(show.ok());
}

#[tokio::test]
async fn squash_reapply_rescues_intermediate_conflicts() {
    let fx = fixture().await;
    let repo = fx.add_repo("myrepo", ApprovalMode::Auto).await;

    let task_id = fx.feature_task(&["myrepo"], "feature").await;
    let wt = fx.home.task_worktree_dir(&fx.team_uuid, "myrepo", task_id);
    // Intermediate commit adds scratch.txt, a later commit removes it:
    // replaying the first commit conflicts with main, but the net diff
    // does not touch scratch.txt at all.
    commit_file(&wt, "scratch.txt", "temporary\n", "add scratch file").await;
    std::fs::remove_file(wt.join("scratch.txt")).unwrap();
    run_git(&["add", "-A"], &wt).await;
    run_git(&["commit", "-m", "drop scratch file"], &wt).await;

    commit_file(&repo, "scratch.txt", "different\n", "main adds scratch").await;

    fx.advance_to_merging(task_id);
    let result = fx.ctx.merge_task(TEAM, &fx.team_uuid, task_id).await;
    assert!(result.success, "{result}");

    run_git(&["checkout", "main"], &repo).await;
    assert!(repo.join("feature.py").exists());
    // main's own scratch.txt survives the squash.
    assert_eq!(
        std::fs::read_to_string(repo.join("scratch.txt")).unwrap(),
        "different\n"
    );
    let log = git(&["log", "--oneline"], &repo).await.unwrap();
    assert!(log.stdout.contains("squash-reapply"));
}

#[tokio::test]
async fn multi_repo_task_merges_every_repo() {
    let fx = fixture().await;
    let repo_a = fx.add_repo("svc-a", ApprovalMode::Auto).await;
    let repo_b = fx.add_repo("svc-b", ApprovalMode::Auto).await;

    let task_id = fx.feature_task(&["svc-a", "svc-b"], "feature").await;
    fx.advance_to_merging(task_id);
    let result = fx.ctx.merge_task(TEAM, &fx.team_uuid, task_id).await;
    assert!(result.success, "{result}");

    for repo in [&repo_a, &repo_b] {
        run_git(&["checkout", "main"], repo).await;
        assert!(repo.join("feature.py").exists());
    }
    let task = fx.task(task_id);
    assert_eq!(task.merge_tip.len(), 2);
    assert_eq!(task.status, TaskStatus::Done);
}

#[tokio::test]
async fn merge_once_auto_approval_merges_immediately() {
    let fx = fixture().await;
    fx.add_repo("myrepo", ApprovalMode::Auto).await;
    let task_id = fx.feature_task(&["myrepo"], "feature").await;
    fx.advance_to_approval(task_id);

    let results = fx.ctx.merge_once(TEAM, &fx.team_uuid).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].success);

    let task = fx.task(task_id);
    assert_eq!(task.status, TaskStatus::Done);
    // The merge transition reassigned to the manager.
    assert_eq!(task.assignee, "lead");
}

#[tokio::test]
async fn merge_once_manual_approval_waits_for_verdict() {
    let fx = fixture().await;
    fx.add_repo("myrepo", ApprovalMode::Manual).await;
    let task_id = fx.feature_task(&["myrepo"], "feature").await;
    fx.advance_to_approval(task_id);

    // No verdict yet: nothing happens.
    let results = fx.ctx.merge_once(TEAM, &fx.team_uuid).await.unwrap();
    assert!(results.is_empty());
    assert_eq!(fx.task(task_id).status, TaskStatus::InApproval);

    // Approved review unlocks the merge.
    {
        let conn = fx.db.conn().unwrap();
        reviews::set_verdict(
            &conn,
            &fx.ids,
            TEAM,
            task_id,
            Verdict::Approved,
            "lgtm",
            "lead",
        )
        .unwrap();
    }
    let results = fx.ctx.merge_once(TEAM, &fx.team_uuid).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].success);
    assert_eq!(fx.task(task_id).status, TaskStatus::Done);
}

#[tokio::test]
async fn merge_once_skips_future_retry_after() {
    let fx = fixture().await;
    fx.add_repo("myrepo", ApprovalMode::Auto).await;
    let task_id = fx.feature_task(&["myrepo"], "feature").await;
    fx.advance_to_merging(task_id);

    // A retry scheduled for the future gates the task out of the scan.
    {
        let conn = fx.db.conn().unwrap();
        tasks::update_task(
            &conn,
            TEAM,
            task_id,
            TaskPatch {
                retry_after: Some(Some(now_unix() + 3600.0)),
                ..Default::default()
            },
        )
        .unwrap();
    }
    let results = fx.ctx.merge_once(TEAM, &fx.team_uuid).await.unwrap();
    assert!(results.is_empty());
    assert_eq!(fx.task(task_id).status, TaskStatus::Merging);

    // An expired gate is cleared and the merge proceeds.
    {
        let conn = fx.db.conn().unwrap();
        tasks::update_task(
            &conn,
            TEAM,
            task_id,
            TaskPatch {
                retry_after: Some(Some(now_unix() - 1.0)),
                ..Default::default()
            },
        )
        .unwrap();
    }
    let results = fx.ctx.merge_once(TEAM, &fx.team_uuid).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].success);
    let task = fx.task(task_id);
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.retry_after, None);
}

#[tokio::test]
async fn merge_once_escalates_conflicts_to_manager() {
    let fx = fixture().await;
    let repo = fx.add_repo("myrepo", ApprovalMode::Auto).await;

    let task_id = fx.feature_task(&["myrepo"], "unused").await;
    let wt = fx.home.task_worktree_dir(&fx.team_uuid, "myrepo", task_id);
    commit_file(&wt, "conflict.txt", "feature version\n", "feature side").await;
    commit_file(&repo, "conflict.txt", "main version\n", "main side").await;
    fx.advance_to_approval(task_id);

    let results = fx.ctx.merge_once(TEAM, &fx.team_uuid).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(!results[0].success);

    // Non-retryable conflict: escalated immediately.
    let task = fx.task(task_id);
    assert_eq!(task.status, TaskStatus::MergeFailed);
    assert_eq!(task.assignee, "lead");
    assert!(!task.status_detail.is_empty());

    // The manager got a conflict notification.
    let conn = fx.db.conn().unwrap();
    let inbox = mailbox::read_inbox(&conn, TEAM, "lead", true).unwrap();
    assert_eq!(inbox.len(), 1);
    assert!(inbox[0].content.contains("T0001"));
    assert_eq!(inbox[0].task_id, Some(task_id));
}

#[tokio::test]
async fn retryable_failure_increments_attempts_and_stays_merging() {
    let fx = fixture().await;
    let repo = fx.add_repo("myrepo", ApprovalMode::Auto).await;
    let task_id = fx.feature_task(&["myrepo"], "feature").await;

    // Dirty main: retryable. Three passes exhaust the attempts.
    std::fs::write(repo.join("README.md"), "dirty\n").unwrap();
    fx.advance_to_approval(task_id);

    let results = fx.ctx.merge_once(TEAM, &fx.team_uuid).await.unwrap();
    assert!(!results[0].success);
    let task = fx.task(task_id);
    assert_eq!(task.status, TaskStatus::Merging);
    assert_eq!(task.merge_attempts, 1);
    assert_eq!(task.status_detail, "main has uncommitted changes");

    let _ = fx.ctx.merge_once(TEAM, &fx.team_uuid).await.unwrap();
    assert_eq!(fx.task(task_id).merge_attempts, 2);

    // Third failure exhausts MAX_MERGE_ATTEMPTS and escalates.
    let _ = fx.ctx.merge_once(TEAM, &fx.team_uuid).await.unwrap();
    let task = fx.task(task_id);
    assert_eq!(task.merge_attempts, 3);
    assert_eq!(task.status, TaskStatus::MergeFailed);
    assert_eq!(task.assignee, "lead");

    // Cleaning the tree and retrying by hand succeeds.
    run_git(&["checkout", "--", "README.md"], &repo).await;
    {
        let conn = fx.db.conn().unwrap();
        tasks::transition_task(&conn, &fx.workflows, TEAM, task_id, TaskStatus::Merging, "lead")
            .unwrap();
    }
    let results = fx.ctx.merge_once(TEAM, &fx.team_uuid).await.unwrap();
    assert!(results[0].success, "{}", results[0]);
    assert_eq!(fx.task(task_id).status, TaskStatus::Done);
}
