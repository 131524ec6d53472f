//! Prompt assembly — a pure string builder over a stable context.
//!
//! The preamble is rebuilt every turn (it depends on the team charter,
//! role charter, team override, and the agent's notes); the user
//! message carries the task context, recent conversation, the new
//! message batch, and the agent's other assigned tasks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use delegate_core::paths::Home;
use delegate_core::types::{Message, Task};

fn read_if_present(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn role_charter(role: &str) -> &'static str {
    match role {
        "manager" => {
            "You are the team manager. You triage incoming work, create and assign \
             tasks, review progress, and keep the human informed. You do not write \
             code yourself; delegate implementation to the engineers."
        }
        _ => {
            "You are a software engineer on the team. Work on your assigned task in \
             its worktree, commit as you go, and move the task forward through the \
             status pipeline when your work is ready for review."
        }
    }
}

/// Builder over one agent's stable context.
pub struct PromptBuilder {
    home: Home,
    team: String,
    team_uuid: String,
    agent: String,
}

impl PromptBuilder {
    pub fn new(home: &Home, team: &str, team_uuid: &str, agent: &str) -> Self {
        Self {
            home: home.clone(),
            team: team.to_string(),
            team_uuid: team_uuid.to_string(),
            agent: agent.to_string(),
        }
    }

    /// Static role instructions for the turn. Rebuilt every turn; the
    /// Telephone rotates when this changes.
    pub fn build_preamble(&self, role: &str) -> String {
        let mut parts: Vec<String> = Vec::new();
        parts.push(format!(
            "You are {}, an AI agent on team {}.",
            self.agent, self.team
        ));
        parts.push(role_charter(role).to_string());

        let team_dir = self.home.team_dir(&self.team_uuid);
        if let Some(charter) = read_if_present(&team_dir.join("shared/charter.md")) {
            parts.push(format!("## Team charter\n\n{charter}"));
        }
        if let Some(override_text) = read_if_present(&team_dir.join("override.md")) {
            parts.push(format!("## Team instructions\n\n{override_text}"));
        }

        let notes = self.home.agent_notes_dir(&self.team_uuid, &self.agent);
        if let Some(reflections) = read_if_present(&notes.join("reflections.md")) {
            parts.push(format!("## Your reflections\n\n{reflections}"));
        }
        if let Some(feedback) = read_if_present(&notes.join("feedback.md")) {
            parts.push(format!("## Feedback you have received\n\n{feedback}"));
        }

        parts.join("\n\n")
    }

    /// The user message for one turn.
    pub fn build_user_message(
        &self,
        batch: &[Message],
        task: Option<&Task>,
        workspace_paths: &BTreeMap<String, PathBuf>,
        history: &[Message],
        other_tasks: &[Task],
    ) -> String {
        let mut parts: Vec<String> = Vec::new();

        if let Some(task) = task {
            let mut section = format!(
                "## Current task: {} — {}\n\nStatus: {}\n",
                task.display_id(),
                task.title,
                task.status
            );
            if !task.description.is_empty() {
                section.push_str(&format!("\n{}\n", task.description));
            }
            if !task.branch.is_empty() {
                section.push_str(&format!("\nBranch: {}\n", task.branch));
            }
            parts.push(section);
        }

        if !workspace_paths.is_empty() {
            let lines: Vec<String> = workspace_paths
                .iter()
                .map(|(repo, path)| format!("- {repo}: {}", path.display()))
                .collect();
            parts.push(format!("## Worktrees\n\n{}", lines.join("\n")));
        }

        if !history.is_empty() {
            let lines: Vec<String> = history
                .iter()
                .map(|m| format!("{} -> {}: {}", m.sender, m.recipient, m.content))
                .collect();
            parts.push(format!("## Recent conversation\n\n{}", lines.join("\n")));
        }

        let lines: Vec<String> = batch
            .iter()
            .map(|m| format!("From {}: {}", m.sender, m.content))
            .collect();
        parts.push(format!("## New messages\n\n{}", lines.join("\n\n")));

        if !other_tasks.is_empty() {
            let lines: Vec<String> = other_tasks
                .iter()
                .map(|t| format!("- {} {} ({})", t.display_id(), t.title, t.status))
                .collect();
            parts.push(format!("## Your other assigned tasks\n\n{}", lines.join("\n")));
        }

        parts.join("\n\n")
    }

    /// Prompt for the optional post-turn reflection.
    pub fn build_reflection_message(&self) -> String {
        "Take a moment to reflect on the turn you just completed. \
         What went well, what slowed you down, and what would you do differently? \
         Append one or two concise bullet points to your notes/reflections.md \
         if you learned something worth keeping."
            .to_string()
    }
}
