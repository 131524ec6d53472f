//! # Delegate Daemon
//!
//! The periodic driver: each tick ensures task worktree infrastructure,
//! dispatches turns for agents with unread mail (bounded by a
//! semaphore, one in-flight turn per agent), runs the merge worker per
//! team (serialized), drives workflow auto-stages, and sends the
//! startup summary. Shutdown is cooperative with bounded waits.

pub mod singleton;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use delegate_core::config;
use delegate_core::error::Result;
use delegate_core::paths::format_task_id;
use delegate_core::types::{Task, TaskStatus};
use delegate_db::tasks::{self, TaskFilter};
use delegate_db::mailbox;
use delegate_git::worktree::create_task_worktree;
use delegate_merge::MergeContext;
use delegate_runtime::turn::list_ai_agents;
use delegate_runtime::Runtime;
use delegate_workflows::{ActionCtx, WorkflowRegistry};

pub use singleton::DaemonSingleton;

/// Tunables for the daemon loop.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub interval: Duration,
    /// Bound on concurrently in-flight agent turns.
    pub max_concurrent_turns: usize,
    /// Delay before the one-shot startup summary to each manager.
    pub startup_notice_delay: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_concurrent_turns: 256,
            startup_notice_delay: Duration::from_secs(60),
        }
    }
}

/// The daemon: owns the runtime, merge context, and dispatch state.
pub struct Daemon {
    pub runtime: Arc<Runtime>,
    pub merge: Arc<MergeContext>,
    config: DaemonConfig,
    /// (team, agent) pairs with a turn currently in flight.
    in_flight: Arc<Mutex<HashSet<(String, String)>>>,
    /// (team, task_id) pairs whose worktree infra was confirmed.
    infra_ready: Mutex<HashSet<(String, i64)>>,
    turn_semaphore: Arc<Semaphore>,
    merge_semaphore: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
    started_at: Instant,
    startup_notified: AtomicBool,
}

impl Daemon {
    pub fn new(runtime: Arc<Runtime>, merge: Arc<MergeContext>, config: DaemonConfig) -> Self {
        let turn_semaphore = Arc::new(Semaphore::new(config.max_concurrent_turns));
        Self {
            runtime,
            merge,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            infra_ready: Mutex::new(HashSet::new()),
            turn_semaphore,
            merge_semaphore: Arc::new(Semaphore::new(1)),
            shutdown: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
            startup_notified: AtomicBool::new(false),
        }
    }

    /// Handle for requesting shutdown from a signal handler.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run until the shutdown flag is set.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            "daemon started (interval {:?}, max {} turns)",
            self.config.interval,
            self.config.max_concurrent_turns
        );
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.tick().await {
                tracing::error!("daemon tick failed: {e}");
            }
        }
        self.shutdown_cleanup().await;
        Ok(())
    }

    /// One pass of the loop. Returns handles for spawned turns so
    /// tests can await them; the run loop lets them detach.
    pub async fn tick(&self) -> Result<Vec<JoinHandle<()>>> {
        let teams = self.active_teams()?;
        let mut handles = Vec::new();

        for (team, team_uuid) in &teams {
            self.ensure_task_infra(team, team_uuid).await?;
            handles.extend(self.dispatch_turns(team, team_uuid)?);
            self.run_merges(team, team_uuid).await;
            self.drive_auto_stages(team)?;
        }

        self.maybe_send_startup_notice(&teams)?;
        Ok(handles)
    }

    fn active_teams(&self) -> Result<Vec<(String, String)>> {
        let conn = self.runtime.db.conn()?;
        let mut stmt = conn
            .prepare("SELECT name, uuid FROM team_ids WHERE deleted = 0 ORDER BY name")
            .map_err(|e| delegate_core::error::DelegateError::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| delegate_core::error::DelegateError::Database(e.to_string()))?;
        let mut teams = Vec::new();
        for row in rows {
            teams.push(
                row.map_err(|e| delegate_core::error::DelegateError::Database(e.to_string()))?,
            );
        }
        Ok(teams)
    }

    /// Ensure worktrees exist for todo/in_progress tasks whose
    /// dependencies are resolved. Confirmed pairs are cached to avoid
    /// redundant stat calls; entries drop when the task is observed
    /// done/cancelled.
    async fn ensure_task_infra(&self, team: &str, team_uuid: &str) -> Result<()> {
        let (pending, finished): (Vec<Task>, Vec<i64>) = {
            let conn = self.runtime.db.conn()?;
            let all = tasks::list_tasks(&conn, team, TaskFilter::default())?;
            let mut pending = Vec::new();
            let mut finished = Vec::new();
            for task in all {
                match task.status {
                    TaskStatus::Todo | TaskStatus::InProgress => {
                        if !task.repos.is_empty()
                            && tasks::all_deps_resolved(&conn, team, &task)?
                        {
                            pending.push(task);
                        }
                    }
                    TaskStatus::Done | TaskStatus::Cancelled => finished.push(task.id),
                    _ => {}
                }
            }
            (pending, finished)
        };

        {
            let mut ready = self.infra_ready.lock().unwrap();
            for task_id in finished {
                ready.remove(&(team.to_string(), task_id));
            }
        }

        for task in pending {
            let key = (team.to_string(), task.id);
            if self.infra_ready.lock().unwrap().contains(&key) {
                continue;
            }
            let mut all_present = true;
            for repo_name in &task.repos {
                let wt = self
                    .runtime
                    .home
                    .task_worktree_dir(team_uuid, repo_name, task.id);
                if wt.is_dir() {
                    continue;
                }
                match create_task_worktree(
                    &self.runtime.db,
                    &self.runtime.home,
                    team,
                    team_uuid,
                    repo_name,
                    task.id,
                    None,
                )
                .await
                {
                    Ok(_) => {}
                    Err(e) => {
                        all_present = false;
                        tracing::warn!(
                            "could not create worktree for {} ({repo_name}): {e}",
                            format_task_id(task.id)
                        );
                    }
                }
            }
            if all_present {
                self.infra_ready.lock().unwrap().insert(key);
            }
        }
        Ok(())
    }

    /// Launch one turn per agent in
    /// `agents_with_unread ∩ ai_agents − in_flight`, skipping agents
    /// who are DRI on a task currently merging (belt and suspenders on
    /// top of the worktree lock).
    fn dispatch_turns(&self, team: &str, team_uuid: &str) -> Result<Vec<JoinHandle<()>>> {
        let conn = self.runtime.db.conn()?;
        let unread = mailbox::agents_with_unread(&conn, team)?;
        let ai_agents = list_ai_agents(&self.runtime.home, team_uuid);
        let merging_dris: HashSet<String> = tasks::list_tasks(
            &conn,
            team,
            TaskFilter {
                status: Some(TaskStatus::Merging),
                ..Default::default()
            },
        )?
        .into_iter()
        .map(|t| t.dri)
        .collect();
        drop(conn);

        let mut handles = Vec::new();
        for agent in unread {
            if !ai_agents.contains(&agent) {
                continue;
            }
            if merging_dris.contains(&agent) {
                tracing::debug!("skipping {team}/{agent}: DRI task is merging");
                continue;
            }
            let key = (team.to_string(), agent.clone());
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                if !in_flight.insert(key.clone()) {
                    continue; // turn already running
                }
            }
            if self.shutdown.load(Ordering::SeqCst) {
                self.in_flight.lock().unwrap().remove(&key);
                break;
            }

            let runtime = self.runtime.clone();
            let in_flight = self.in_flight.clone();
            let semaphore = self.turn_semaphore.clone();
            let team = team.to_string();
            let team_uuid = team_uuid.to_string();
            let agent_name = agent.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                match runtime.run_turn(&team, &team_uuid, &agent_name).await {
                    Ok(result) => {
                        if let Some(error) = result.error {
                            tracing::warn!("turn for {team}/{agent_name} errored: {error}");
                        }
                    }
                    Err(e) => tracing::error!("turn for {team}/{agent_name} failed: {e}"),
                }
                in_flight
                    .lock()
                    .unwrap()
                    .remove(&(team.clone(), agent_name.clone()));
            }));
        }
        Ok(handles)
    }

    /// Merge scan for one team, serialized across teams so two teams
    /// never fight over the same main-repo head.
    async fn run_merges(&self, team: &str, team_uuid: &str) {
        let _permit = self.merge_semaphore.acquire().await.ok();
        match self.merge.merge_once(team, team_uuid).await {
            Ok(results) => {
                for result in results.iter().filter(|r| !r.success) {
                    tracing::info!("merge: {result}");
                }
            }
            Err(e) => tracing::error!("merge_once for {team} failed: {e}"),
        }
    }

    /// Run auto-stage actions for workflow-driven tasks: `None` stays,
    /// a returned key transitions, an action error routes to the
    /// workflow's error stage when defined.
    fn drive_auto_stages(&self, team: &str) -> Result<()> {
        let conn = self.runtime.db.conn()?;
        let all = tasks::list_tasks(&conn, team, TaskFilter::default())?;
        let workflows: &WorkflowRegistry = &self.runtime.workflows;

        for task in all {
            let workflow = workflows.get(&task.workflow, task.workflow_version);
            let Some(stage) = workflow.get_stage(task.status.as_str()) else {
                continue;
            };
            if !stage.auto {
                continue;
            }
            let Some(action) = &stage.action else {
                continue;
            };
            let ctx = ActionCtx {
                team: team.to_string(),
                task: task.clone(),
            };
            match action(&ctx) {
                Ok(None) => {}
                Ok(Some(next_key)) => {
                    if let Some(next) = TaskStatus::parse(&next_key) {
                        if let Err(e) =
                            tasks::change_status(&conn, workflows, team, task.id, next)
                        {
                            tracing::warn!(
                                "auto-stage transition for {} failed: {e}",
                                task.display_id()
                            );
                        } else if workflow.is_terminal(&next_key) {
                            self.notify_manager(
                                team,
                                &task.team_uuid,
                                &format!(
                                    "{} reached terminal stage {next_key}",
                                    task.display_id()
                                ),
                                Some(task.id),
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("auto-stage action for {} failed: {e}", task.display_id());
                    match workflow.error_stage() {
                        Some(_) => {
                            let _ = tasks::change_status(
                                &conn,
                                workflows,
                                team,
                                task.id,
                                TaskStatus::Error,
                            );
                        }
                        None => {
                            let _ = mailbox::log_event(
                                &conn,
                                &self.runtime.ids,
                                team,
                                &format!("{} auto-stage action failed: {e}", task.display_id()),
                                Some(task.id),
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// One-shot startup summary to each manager, once the delay has
    /// passed and only when the team has active tasks.
    fn maybe_send_startup_notice(&self, teams: &[(String, String)]) -> Result<()> {
        if self.startup_notified.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.started_at.elapsed() < self.config.startup_notice_delay {
            return Ok(());
        }
        self.startup_notified.store(true, Ordering::SeqCst);

        for (team, team_uuid) in teams {
            let conn = self.runtime.db.conn()?;
            let all = tasks::list_tasks(&conn, team, TaskFilter::default())?;
            let active = all.iter().filter(|t| !t.status.is_terminal()).count();
            if active == 0 {
                continue;
            }
            drop(conn);
            self.notify_manager(
                team,
                team_uuid,
                &format!(
                    "Daemon started. {} tasks total, {active} active.",
                    all.len()
                ),
                None,
            );
        }
        Ok(())
    }

    fn notify_manager(&self, team: &str, team_uuid: &str, body: &str, task_id: Option<i64>) {
        let Some(manager) = config::find_manager(&self.runtime.home, team_uuid) else {
            return;
        };
        if let Ok(conn) = self.runtime.db.conn() {
            let _ = mailbox::send(
                &conn,
                &self.runtime.ids,
                team,
                "system",
                &manager,
                body,
                task_id,
            );
        }
    }

    /// Cooperative shutdown: refuse new dispatches, wait briefly for
    /// in-flight turns, disconnect all Telephones.
    async fn shutdown_cleanup(&self) {
        tracing::info!("daemon shutting down");
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if self.in_flight.lock().unwrap().is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.in_flight.lock().unwrap().len();
        if remaining > 0 {
            tracing::warn!("{remaining} turns still in flight at shutdown");
        }
        let close = self.runtime.exchange.close_all();
        if tokio::time::timeout(Duration::from_secs(10), close)
            .await
            .is_err()
        {
            tracing::warn!("telephone shutdown timed out");
        }
    }
}
