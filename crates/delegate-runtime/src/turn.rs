//! `run_turn` — a single agent turn, from batch selection to worklog.

use std::sync::Arc;

use delegate_core::config::{self, AgentState};
use delegate_core::error::Result;
use delegate_core::paths::{format_task_id, Home};
use delegate_core::types::{Task, TaskStatus};
use delegate_db::tasks::{self, TaskFilter};
use delegate_db::{ids::IdRegistry, mailbox, sessions, Db};
use delegate_telephone::sdk::{ContentBlock, SdkConnector, SdkMessage};
use delegate_telephone::telephone::{RotationCallback, Telephone, TelephoneConfig};
use delegate_telephone::{TelephoneExchange, Usage};
use delegate_workflows::WorkflowRegistry;

use crate::activity::{ActivityEvent, ActivityHub};
use crate::batch::{select_batch, MAX_BATCH_SIZE};
use crate::prompt::PromptBuilder;
use crate::workspace::resolve_workspace;

/// Tool patterns agents may never use. Branch topology and remote
/// interaction belong exclusively to the merge worker.
pub const DISALLOWED_TOOLS: &[&str] = &[
    "Bash(git rebase:*)",
    "Bash(git merge:*)",
    "Bash(git pull:*)",
    "Bash(git push:*)",
    "Bash(git fetch:*)",
    "Bash(git checkout:*)",
    "Bash(git switch:*)",
    "Bash(git reset --hard:*)",
    "Bash(git worktree:*)",
    "Bash(git branch:*)",
    "Bash(git remote:*)",
    "Bash(git filter-branch:*)",
];

/// Chance of appending a reflection turn after the main turn.
pub const REFLECTION_PROBABILITY: f64 = 0.1;

/// Conversation history depth included in the prompt.
const HISTORY_LIMIT: usize = 20;

/// Result of a single agent turn.
#[derive(Debug, Clone, Default)]
pub struct TurnResult {
    pub agent: String,
    pub team: String,
    pub session_id: i64,
    pub usage: Usage,
    pub turns: u32,
    pub error: Option<String>,
}

/// Shared handles the daemon threads a turn through.
pub struct Runtime {
    pub db: Db,
    pub ids: IdRegistry,
    pub home: Home,
    pub exchange: Arc<TelephoneExchange>,
    pub connector: Arc<dyn SdkConnector>,
    pub hub: Arc<ActivityHub>,
    pub workflows: Arc<WorkflowRegistry>,
    pub reflection_probability: f64,
}

impl Runtime {
    pub fn new(
        db: Db,
        ids: IdRegistry,
        home: Home,
        exchange: Arc<TelephoneExchange>,
        connector: Arc<dyn SdkConnector>,
        hub: Arc<ActivityHub>,
        workflows: Arc<WorkflowRegistry>,
    ) -> Self {
        Self {
            db,
            ids,
            home,
            exchange,
            connector,
            hub,
            workflows,
            reflection_probability: REFLECTION_PROBABILITY,
        }
    }

    /// Run a single turn for an agent with unread mail.
    ///
    /// Turn failures (SDK crash, connection loss) are captured into
    /// `TurnResult.error`; the selected batch is still marked
    /// processed so the daemon does not replay it forever.
    pub async fn run_turn(&self, team: &str, team_uuid: &str, agent: &str) -> Result<TurnResult> {
        let mut result = TurnResult {
            agent: agent.to_string(),
            team: team.to_string(),
            ..Default::default()
        };

        // Context load: role/model from state.yaml; missing state gets
        // the defaults (engineer on the default model).
        let state =
            AgentState::load(&self.home.agent_state_path(team_uuid, agent)).unwrap_or_default();
        let role = state.role().to_string();
        let model = state.effective_model();

        // Message selection. The connection must not live across an
        // await, so all DB work happens in scoped blocks.
        let (batch, batch_ids, current_task) = {
            let conn = self.db.conn()?;
            let inbox = mailbox::read_inbox(&conn, team, agent, true)?;
            let human = config::default_human(&self.home);
            let batch = select_batch(&inbox, MAX_BATCH_SIZE, human.as_deref());
            if batch.is_empty() {
                return Ok(result);
            }
            let batch_ids: Vec<i64> = batch.iter().map(|m| m.id).collect();
            let current_task: Option<Task> = match batch[0].task_id {
                Some(task_id) => tasks::get_task(&conn, team, task_id).ok(),
                None => None,
            };

            // Cancelled/done task: discard the batch without a turn.
            if let Some(task) = &current_task {
                if matches!(task.status, TaskStatus::Cancelled | TaskStatus::Done) {
                    tracing::info!(
                        "task {} is {} — discarding {} message(s) for {}",
                        task.display_id(),
                        task.status,
                        batch.len(),
                        agent
                    );
                    mailbox::mark_seen_batch(&conn, &batch_ids)?;
                    mailbox::mark_processed_batch(&conn, &batch_ids)?;
                    return Ok(result);
                }
            }
            (batch, batch_ids, current_task)
        };
        let current_task_id = batch[0].task_id;
        let primary_sender = batch[0].sender.clone();

        let (workspace, workspace_paths) =
            resolve_workspace(&self.home, team_uuid, agent, current_task.as_ref())?;

        // Mark seen, open the DB session, gather prompt inputs.
        let (session_id, history, other_tasks) = {
            let conn = self.db.conn()?;
            mailbox::mark_seen_batch(&conn, &batch_ids)?;
            let session_id =
                sessions::start_session(&conn, &self.ids, team, agent, current_task_id)?;
            let history =
                mailbox::recent_conversation(&conn, team, agent, None, HISTORY_LIMIT)?;
            let other_tasks: Vec<Task> = tasks::list_tasks(
                &conn,
                team,
                TaskFilter {
                    assignee: Some(agent),
                    ..Default::default()
                },
            )?
            .into_iter()
            .filter(|t| Some(t.id) != current_task_id && !t.status.is_terminal())
            .collect();
            (session_id, history, other_tasks)
        };
        result.session_id = session_id;

        self.hub.broadcast(ActivityEvent::TurnStarted {
            agent: agent.to_string(),
            team: team.to_string(),
            task_id: current_task_id,
            sender: Some(primary_sender.clone()),
        });

        // Prompt assembly. The preamble is rebuilt every turn; a
        // changed preamble rotates the Telephone so the new one lands
        // on the next generation's turn 0.
        let builder = PromptBuilder::new(&self.home, team, team_uuid, agent);
        let preamble = builder.build_preamble(&role);
        let user_msg = builder.build_user_message(
            &batch,
            current_task.as_ref(),
            &workspace_paths,
            &history,
            &other_tasks,
        );

        let telephone = match self.exchange.get(team, agent) {
            Some(telephone) => telephone,
            None => self.exchange.put(
                team,
                agent,
                self.create_telephone(team_uuid, agent, &preamble, &model),
            ),
        };
        let mut telephone = telephone.lock().await;
        if telephone.preamble != preamble {
            tracing::info!("preamble changed for {team}/{agent} — rotating telephone");
            telephone.rotate().await?;
            telephone.preamble = preamble.clone();
        }

        let task_label = current_task_id.map(format_task_id).unwrap_or_default();
        let mut worklog: Vec<String> = vec![
            format!("# Worklog — {agent}"),
            if task_label.is_empty() {
                "Task: (none)".to_string()
            } else {
                format!("Task: {task_label}")
            },
            format!("Workspace: {}", workspace.display()),
            format!("Messages in batch: {}", batch.len()),
            format!("\n## Turn 1\n{user_msg}"),
        ];

        // Main turn.
        let snapshot = telephone.usage();
        let stream_result = telephone
            .send(&user_msg, |msg| {
                self.observe_message(msg, agent, team, current_task_id, &mut worklog);
            })
            .await;
        result.usage += telephone.usage() - snapshot;
        result.turns = 1;

        // The batch is marked processed in both outcomes: replay
        // storms are worse than a dropped turn.
        {
            let conn = self.db.conn()?;
            mailbox::mark_processed_batch(&conn, &batch_ids)?;
        }

        if let Err(e) = stream_result {
            tracing::warn!("turn failed for {team}/{agent}: {e}");
            result.error = Some(e.to_string());
            self.finalize(team, team_uuid, agent, &result, &worklog, current_task_id, &primary_sender);
            return Ok(result);
        }

        // Task re-association: a taskless batch that woke an agent
        // with an in-progress task gets attributed to that task.
        let mut final_task_id = current_task_id;
        if current_task_id.is_none() {
            let conn = self.db.conn()?;
            let open = tasks::list_tasks(
                &conn,
                team,
                TaskFilter {
                    status: Some(TaskStatus::InProgress),
                    assignee: Some(agent),
                    ..Default::default()
                },
            )?;
            if let Some(task) = open.first() {
                sessions::update_session_task(&conn, team, session_id, task.id)?;
                final_task_id = Some(task.id);
            }
        }

        // Reflection coin flip, on the same Telephone so the model has
        // the main turn's context.
        if rand::random::<f64>() < self.reflection_probability {
            let reflection = builder.build_reflection_message();
            worklog.push(format!("\n## Turn 2 (reflection)\n{reflection}"));
            let snapshot = telephone.usage();
            match telephone
                .send(&reflection, |msg| {
                    self.observe_message(msg, agent, team, final_task_id, &mut worklog);
                })
                .await
            {
                Ok(()) => {
                    result.usage += telephone.usage() - snapshot;
                    result.turns = 2;
                }
                Err(e) => {
                    tracing::warn!("reflection turn failed for {team}/{agent}: {e}");
                }
            }
        }
        drop(telephone);

        self.finalize(team, team_uuid, agent, &result, &worklog, final_task_id, &primary_sender);
        Ok(result)
    }

    /// Forward one streamed message into the activity hub + worklog.
    fn observe_message(
        &self,
        msg: &SdkMessage,
        agent: &str,
        team: &str,
        task_id: Option<i64>,
        worklog: &mut Vec<String>,
    ) {
        let SdkMessage::Assistant { content, .. } = msg else {
            return;
        };
        for block in content {
            match block {
                ContentBlock::Text { text } => {
                    worklog.push(text.clone());
                }
                ContentBlock::ToolUse { name, input } => {
                    let detail = tool_detail(name, input);
                    worklog.push(format!("`{name}` {detail}"));
                    self.hub.broadcast(ActivityEvent::Tool {
                        agent: agent.to_string(),
                        team: team.to_string(),
                        tool: name.clone(),
                        detail,
                        task_id,
                    });
                }
            }
        }
    }

    /// Session close, worklog write, turn_ended broadcast.
    fn finalize(
        &self,
        team: &str,
        team_uuid: &str,
        agent: &str,
        result: &TurnResult,
        worklog: &[String],
        task_id: Option<i64>,
        primary_sender: &str,
    ) {
        let tokens = sessions::SessionTokens {
            tokens_in: result.usage.input_tokens,
            tokens_out: result.usage.output_tokens,
            cache_read_tokens: result.usage.cache_read_tokens,
            cache_write_tokens: result.usage.cache_write_tokens,
            cost_usd: result.usage.cost_usd,
        };
        match self.db.conn() {
            Ok(conn) => {
                if let Err(e) = sessions::end_session(&conn, team, result.session_id, tokens) {
                    tracing::error!("failed to end session {}: {e}", result.session_id);
                }
            }
            Err(e) => tracing::error!("failed to end session {}: {e}", result.session_id),
        }

        if let Err(e) = self.write_worklog(team_uuid, agent, worklog) {
            tracing::warn!("failed to write worklog for {team}/{agent}: {e}");
        }

        self.hub.broadcast(ActivityEvent::TurnEnded {
            agent: agent.to_string(),
            team: team.to_string(),
            task_id,
            sender: Some(primary_sender.to_string()),
        });
    }

    fn create_telephone(
        &self,
        team_uuid: &str,
        agent: &str,
        preamble: &str,
        model: &str,
    ) -> Telephone {
        let context_path = self.home.agent_context_path(team_uuid, agent);
        let memory = std::fs::read_to_string(&context_path).unwrap_or_default();
        let on_rotation: RotationCallback = {
            let context_path = context_path.clone();
            Arc::new(move |memory: &str| {
                if memory.is_empty() {
                    return;
                }
                if let Some(parent) = context_path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(&context_path, memory) {
                    tracing::warn!("failed to persist rotation memory: {e}");
                }
            })
        };

        Telephone::new(
            TelephoneConfig {
                preamble: preamble.to_string(),
                cwd: self.home.team_dir(team_uuid),
                memory,
                model: Some(model.to_string()),
                add_dirs: vec![self.home.root().to_path_buf()],
                disallowed_tools: DISALLOWED_TOOLS.iter().map(|s| s.to_string()).collect(),
                on_rotation: Some(on_rotation),
                ..Default::default()
            },
            self.connector.clone(),
        )
    }

    fn write_worklog(&self, team_uuid: &str, agent: &str, lines: &[String]) -> Result<()> {
        let logs_dir = self.home.agent_logs_dir(team_uuid, agent);
        std::fs::create_dir_all(&logs_dir)?;
        let n = next_worklog_number(&logs_dir);
        std::fs::write(logs_dir.join(format!("{n}.worklog.md")), lines.join("\n"))?;
        Ok(())
    }
}

/// Compact one-liner for a tool invocation, for SSE + worklog.
fn tool_detail(name: &str, input: &serde_json::Value) -> String {
    let field = |key: &str| {
        input
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    match name {
        "Bash" => {
            let command = field("command");
            command.chars().take(120).collect()
        }
        "Edit" | "Write" | "Read" | "MultiEdit" => field("file_path"),
        "Grep" | "Glob" => field("pattern"),
        _ => {
            let keys: Vec<&str> = input
                .as_object()
                .map(|o| o.keys().map(String::as_str).take(3).collect())
                .unwrap_or_default();
            if keys.is_empty() {
                name.to_string()
            } else {
                format!("{name}({})", keys.join(", "))
            }
        }
    }
}

fn next_worklog_number(logs_dir: &std::path::Path) -> u64 {
    let mut max = 0;
    if let Ok(entries) = std::fs::read_dir(logs_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(num) = name.strip_suffix(".worklog.md") {
                if let Ok(n) = num.parse::<u64>() {
                    max = max.max(n);
                }
            }
        }
    }
    max + 1
}

/// Agent names for a team, excluding human members and legacy
/// boss-role agents. Humans never get turns dispatched.
pub fn list_ai_agents(home: &Home, team_uuid: &str) -> Vec<String> {
    let human_names: Vec<String> = config::human_members(home)
        .into_iter()
        .map(|m| m.name)
        .collect();

    let agents_dir = home.agents_dir(team_uuid);
    let Ok(entries) = std::fs::read_dir(&agents_dir) else {
        return Vec::new();
    };
    let mut agents = Vec::new();
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if human_names.contains(&name) {
            continue;
        }
        let state_path = home.agent_state_path(team_uuid, &name);
        if !state_path.exists() {
            continue;
        }
        let state = AgentState::load(&state_path).unwrap_or_default();
        if state.role() == "boss" {
            continue;
        }
        agents.push(name);
    }
    agents.sort();
    agents
}

#[cfg(test)]
mod tests {
    use super::*;
    use delegate_core::types::MemberKind;
    use delegate_db::tasks::NewTask;
    use delegate_telephone::testing::{script_result, script_text, script_tool, MockConnector};
    use delegate_workflows::WorkflowRegistry;

    struct Fixture {
        _dir: tempfile::TempDir,
        runtime: Runtime,
        connector: Arc<MockConnector>,
        team_uuid: String,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let home = Home::at(dir.path());
        let db = Db::open(home.clone()).unwrap();
        let ids = IdRegistry::new();
        let team_uuid = {
            let conn = db.conn().unwrap();
            let uuid = ids.register_team(&conn, "alpha", None).unwrap();
            ids.register_member(&conn, MemberKind::Agent, Some(&uuid), "worker")
                .unwrap();
            ids.register_member(&conn, MemberKind::Human, None, "dana")
                .unwrap();
            uuid
        };
        // Agent state on disk.
        let agent_dir = home.agent_dir(&team_uuid, "worker");
        std::fs::create_dir_all(&agent_dir).unwrap();
        std::fs::write(
            home.agent_state_path(&team_uuid, "worker"),
            "role: engineer\nmodel: sonnet\n",
        )
        .unwrap();

        let connector = MockConnector::new();
        let mut runtime = Runtime::new(
            db,
            ids,
            home,
            Arc::new(TelephoneExchange::new()),
            connector.clone(),
            Arc::new(ActivityHub::new()),
            Arc::new(WorkflowRegistry::new()),
        );
        runtime.reflection_probability = 0.0;
        Fixture {
            _dir: dir,
            runtime,
            connector,
            team_uuid,
        }
    }

    fn deliver(fx: &Fixture, sender: &str, content: &str, task_id: Option<i64>) -> i64 {
        let conn = fx.runtime.db.conn().unwrap();
        mailbox::send(
            &conn,
            &fx.runtime.ids,
            "alpha",
            sender,
            "worker",
            content,
            task_id,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_no_unread_is_a_noop() {
        let fx = fixture();
        let result = fx
            .runtime
            .run_turn("alpha", &fx.team_uuid, "worker")
            .await
            .unwrap();
        assert_eq!(result.session_id, 0);
        assert_eq!(fx.connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_happy_path_turn() {
        let fx = fixture();
        deliver(&fx, "dana", "please look into the flaky test", None);
        fx.connector.push_turn(vec![
            script_text("investigating"),
            script_tool("Bash", serde_json::json!({"command": "cargo test -q"})),
            script_result(500, 80, 0.03),
        ]);

        let (_sub, mut events) = fx.runtime.hub.subscribe(None);
        let result = fx
            .runtime
            .run_turn("alpha", &fx.team_uuid, "worker")
            .await
            .unwrap();

        assert!(result.error.is_none());
        assert_eq!(result.turns, 1);
        assert_eq!(result.usage.input_tokens, 500);
        assert!(result.session_id > 0);

        // Turn-0 composite prompt includes preamble and the message.
        let prompts = fx.connector.prompts();
        assert!(prompts[0].starts_with("## PREAMBLE"));
        assert!(prompts[0].contains("please look into the flaky test"));

        // Batch fully processed.
        let conn = fx.runtime.db.conn().unwrap();
        assert_eq!(mailbox::count_unread(&conn, "alpha", "worker").unwrap(), 0);

        // Session closed with the turn's tokens.
        let session = sessions::get_session(&conn, "alpha", result.session_id)
            .unwrap()
            .unwrap();
        assert!(session.ended_at.is_some());
        assert_eq!(session.tokens_in, 500);

        // Worklog written.
        let logs = fx.runtime.home.agent_logs_dir(&fx.team_uuid, "worker");
        let worklog = std::fs::read_to_string(logs.join("1.worklog.md")).unwrap();
        assert!(worklog.contains("cargo test -q"));

        // turn_started, tool, turn_ended on the activity stream.
        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(match event {
                ActivityEvent::TurnStarted { .. } => "turn_started",
                ActivityEvent::Tool { .. } => "tool",
                ActivityEvent::TurnEnded { .. } => "turn_ended",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["turn_started", "tool", "turn_ended"]);
    }

    #[tokio::test]
    async fn test_done_task_batch_discarded() {
        let fx = fixture();
        let task_id = {
            let conn = fx.runtime.db.conn().unwrap();
            let task = tasks::create_task(
                &conn,
                &fx.runtime.ids,
                "alpha",
                NewTask {
                    title: "old".into(),
                    ..Default::default()
                },
            )
            .unwrap();
            tasks::change_status(
                &conn,
                &fx.runtime.workflows,
                "alpha",
                task.id,
                TaskStatus::Cancelled,
            )
            .unwrap();
            task.id
        };
        deliver(&fx, "dana", "about that old task", Some(task_id));

        let result = fx
            .runtime
            .run_turn("alpha", &fx.team_uuid, "worker")
            .await
            .unwrap();
        // No turn ran, but the batch is consumed.
        assert_eq!(result.session_id, 0);
        assert_eq!(fx.connector.connect_count(), 0);
        let conn = fx.runtime.db.conn().unwrap();
        assert_eq!(mailbox::count_unread(&conn, "alpha", "worker").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_turn_error_marks_processed() {
        let fx = fixture();
        deliver(&fx, "dana", "hello", None);
        fx.connector.fail_queries();

        let result = fx
            .runtime
            .run_turn("alpha", &fx.team_uuid, "worker")
            .await
            .unwrap();
        assert!(result.error.is_some());
        assert!(result.usage.is_zero());

        let conn = fx.runtime.db.conn().unwrap();
        assert_eq!(mailbox::count_unread(&conn, "alpha", "worker").unwrap(), 0);
        // Session still closed.
        let session = sessions::get_session(&conn, "alpha", result.session_id)
            .unwrap()
            .unwrap();
        assert!(session.ended_at.is_some());
        assert_eq!(session.tokens_in, 0);
    }

    #[tokio::test]
    async fn test_reflection_turn_folds_tokens() {
        let mut fx = fixture();
        fx.runtime.reflection_probability = 1.0;
        deliver(&fx, "dana", "work on this", None);
        fx.connector
            .push_turn(vec![script_text("done"), script_result(100, 10, 0.01)]);
        fx.connector
            .push_turn(vec![script_text("reflected"), script_result(30, 5, 0.02)]);

        let result = fx
            .runtime
            .run_turn("alpha", &fx.team_uuid, "worker")
            .await
            .unwrap();
        assert_eq!(result.turns, 2);
        assert_eq!(result.usage.input_tokens, 130);
        let prompts = fx.connector.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("reflect"));
    }

    #[tokio::test]
    async fn test_preamble_change_rotates_telephone() {
        let fx = fixture();
        deliver(&fx, "dana", "first", None);
        fx.connector
            .push_turn(vec![script_result(10, 2, 0.01)]);
        fx.runtime
            .run_turn("alpha", &fx.team_uuid, "worker")
            .await
            .unwrap();

        // Changing the override changes the preamble.
        std::fs::write(
            fx.runtime.home.team_dir(&fx.team_uuid).join("override.md"),
            "New standing instructions.\n",
        )
        .unwrap();

        deliver(&fx, "dana", "second", None);
        // Rotation summary turn, then the real turn.
        fx.connector
            .push_turn(vec![script_text("memory summary"), script_result(5, 5, 0.02)]);
        fx.connector.push_turn(vec![script_result(10, 2, 0.01)]);
        fx.runtime
            .run_turn("alpha", &fx.team_uuid, "worker")
            .await
            .unwrap();

        let telephone = fx.runtime.exchange.get("alpha", "worker").unwrap();
        let telephone = telephone.lock().await;
        assert_eq!(telephone.generation, 1);
        assert!(telephone.preamble.contains("New standing instructions."));
        // Rotation memory persisted to context.md.
        let context = std::fs::read_to_string(
            fx.runtime.home.agent_context_path(&fx.team_uuid, "worker"),
        )
        .unwrap();
        assert_eq!(context, "memory summary");
    }

    #[tokio::test]
    async fn test_task_reassociation() {
        let fx = fixture();
        let task_id = {
            let conn = fx.runtime.db.conn().unwrap();
            let task = tasks::create_task(
                &conn,
                &fx.runtime.ids,
                "alpha",
                NewTask {
                    title: "wip".into(),
                    assignee: "worker".into(),
                    ..Default::default()
                },
            )
            .unwrap();
            tasks::change_status(
                &conn,
                &fx.runtime.workflows,
                "alpha",
                task.id,
                TaskStatus::InProgress,
            )
            .unwrap();
            task.id
        };
        // Taskless message; the session should re-associate.
        deliver(&fx, "dana", "how is it going?", None);
        fx.connector.push_turn(vec![script_result(10, 2, 0.01)]);

        let result = fx
            .runtime
            .run_turn("alpha", &fx.team_uuid, "worker")
            .await
            .unwrap();
        let conn = fx.runtime.db.conn().unwrap();
        let session = sessions::get_session(&conn, "alpha", result.session_id)
            .unwrap()
            .unwrap();
        assert_eq!(session.task_id, Some(task_id));
    }

    #[test]
    fn test_list_ai_agents_excludes_humans_and_boss() {
        let fx = fixture();
        let home = &fx.runtime.home;
        // A human member with an agent-looking directory.
        std::fs::create_dir_all(home.members_dir()).unwrap();
        std::fs::write(home.member_file("dana"), "name: dana\n").unwrap();
        let dana_dir = home.agent_dir(&fx.team_uuid, "dana");
        std::fs::create_dir_all(&dana_dir).unwrap();
        std::fs::write(home.agent_state_path(&fx.team_uuid, "dana"), "role: human\n").unwrap();
        // A legacy boss agent.
        let boss_dir = home.agent_dir(&fx.team_uuid, "old-boss");
        std::fs::create_dir_all(&boss_dir).unwrap();
        std::fs::write(
            home.agent_state_path(&fx.team_uuid, "old-boss"),
            "role: boss\n",
        )
        .unwrap();

        let agents = list_ai_agents(home, &fx.team_uuid);
        assert_eq!(agents, vec!["worker"]);
    }

    #[test]
    fn test_tool_detail_formats() {
        assert_eq!(
            tool_detail("Bash", &serde_json::json!({"command": "ls -la"})),
            "ls -la"
        );
        assert_eq!(
            tool_detail("Edit", &serde_json::json!({"file_path": "src/a.rs"})),
            "src/a.rs"
        );
        assert_eq!(
            tool_detail("Grep", &serde_json::json!({"pattern": "fn main"})),
            "fn main"
        );
        assert_eq!(
            tool_detail("WebFetch", &serde_json::json!({"url": "x"})),
            "WebFetch(url)"
        );
    }
}
