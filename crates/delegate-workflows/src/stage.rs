//! Workflow stages — the building blocks of a task workflow.

use std::sync::Arc;

use delegate_core::types::Task;
use thiserror::Error;

/// Failure raised by an auto-stage action; routes the task to the
/// workflow's `error` stage when one is defined.
#[derive(Debug, Error)]
#[error("stage action failed: {0}")]
pub struct ActionError(pub String);

/// Context handed to an auto-stage action.
#[derive(Debug, Clone)]
pub struct ActionCtx {
    pub team: String,
    pub task: Task,
}

/// An auto-stage action: returns the next stage key, or `None` to stay.
pub type StageAction =
    Arc<dyn Fn(&ActionCtx) -> Result<Option<String>, ActionError> + Send + Sync>;

/// One stage in a workflow's stage map.
#[derive(Clone)]
pub struct Stage {
    /// Status string stored on the task (`todo`, `merging`, ...).
    pub key: String,
    /// Human-readable label for the UI.
    pub label: String,
    /// Terminal stages stop the pipeline and stamp `completed_at`.
    pub terminal: bool,
    /// Auto stages are driven by the daemon once per tick.
    pub auto: bool,
    /// Action for auto stages; ignored otherwise.
    pub action: Option<StageAction>,
}

impl Stage {
    pub fn new(key: &str, label: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            terminal: false,
            auto: false,
            action: None,
        }
    }

    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    pub fn auto(mut self, action: StageAction) -> Self {
        self.auto = true;
        self.action = Some(action);
        self
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("key", &self.key)
            .field("label", &self.label)
            .field("terminal", &self.terminal)
            .field("auto", &self.auto)
            .finish()
    }
}
