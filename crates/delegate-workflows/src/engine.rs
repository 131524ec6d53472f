//! Workflow registry and the built-in default status machine.

use std::collections::HashMap;

use crate::stage::Stage;

/// Name of the built-in workflow applied when a task sets none.
pub const DEFAULT_WORKFLOW: &str = "default";

/// A named, versioned stage map with its allowed transitions.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub version: i64,
    stages: Vec<Stage>,
    /// from-key -> allowed to-keys.
    transitions: HashMap<String, Vec<String>>,
}

impl Workflow {
    pub fn new(name: &str, version: i64) -> Self {
        Self {
            name: name.to_string(),
            version,
            stages: Vec::new(),
            transitions: HashMap::new(),
        }
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn transition(mut self, from: &str, to: &[&str]) -> Self {
        self.transitions
            .entry(from.to_string())
            .or_default()
            .extend(to.iter().map(|s| s.to_string()));
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn get_stage(&self, key: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.key == key)
    }

    /// Whether the machine allows `from -> to`. Self-transitions are
    /// permitted (idempotent status writes).
    pub fn allows(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }
        self.transitions
            .get(from)
            .map(|targets| targets.iter().any(|t| t == to))
            .unwrap_or(false)
    }

    pub fn is_terminal(&self, key: &str) -> bool {
        self.get_stage(key).map(|s| s.terminal).unwrap_or(false)
    }

    /// Keys of all auto stages.
    pub fn auto_stages(&self) -> Vec<&Stage> {
        self.stages.iter().filter(|s| s.auto).collect()
    }

    /// The `error` stage key, if this workflow defines one.
    pub fn error_stage(&self) -> Option<&str> {
        self.get_stage("error").map(|s| s.key.as_str())
    }
}

/// The built-in machine:
/// `todo -> in_progress -> in_review -> in_approval -> merging -> done`
/// with side-paths `rejected`, `cancelled`, `merge_failed`, `error`.
pub fn default_workflow() -> Workflow {
    Workflow::new(DEFAULT_WORKFLOW, 1)
        .stage(Stage::new("todo", "To do"))
        .stage(Stage::new("in_progress", "In progress"))
        .stage(Stage::new("in_review", "In review"))
        .stage(Stage::new("in_approval", "In approval"))
        .stage(Stage::new("merging", "Merging"))
        .stage(Stage::new("done", "Done").terminal())
        .stage(Stage::new("rejected", "Rejected"))
        .stage(Stage::new("cancelled", "Cancelled").terminal())
        .stage(Stage::new("merge_failed", "Merge failed"))
        .stage(Stage::new("error", "Error").terminal())
        .transition("todo", &["in_progress", "cancelled"])
        .transition("in_progress", &["in_review", "todo", "cancelled", "error"])
        .transition("in_review", &["in_approval", "rejected", "in_progress", "cancelled"])
        .transition("in_approval", &["merging", "rejected", "in_review", "cancelled"])
        .transition("merging", &["done", "merge_failed", "cancelled"])
        .transition("merge_failed", &["merging", "in_progress", "cancelled"])
        .transition("rejected", &["in_progress", "cancelled"])
        .transition("error", &["in_progress", "cancelled"])
}

/// Process-scoped registry of workflows, keyed by `(name, version)`.
/// Always serves the built-in default.
pub struct WorkflowRegistry {
    workflows: HashMap<(String, i64), Workflow>,
    default: Workflow,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            workflows: HashMap::new(),
            default: default_workflow(),
        }
    }

    pub fn register(&mut self, workflow: Workflow) {
        tracing::info!(
            "Registered workflow {} v{} ({} stages)",
            workflow.name,
            workflow.version,
            workflow.stages().len()
        );
        self.workflows
            .insert((workflow.name.clone(), workflow.version), workflow);
    }

    /// Look up a workflow; unknown names/versions fall back to default.
    pub fn get(&self, name: &str, version: i64) -> &Workflow {
        self.workflows
            .get(&(name.to_string(), version))
            .unwrap_or(&self.default)
    }

    pub fn default_workflow(&self) -> &Workflow {
        &self.default
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}
