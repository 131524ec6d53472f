//! # Delegate Workflows
//!
//! Per-team workflow definitions over the task status machine. A
//! workflow is a named, versioned stage map; each stage carries a
//! status key, a label, terminal/auto flags, and (for auto stages) an
//! action the daemon drives once per tick. When a task has no workflow
//! set, the built-in default machine applies.

pub mod engine;
pub mod stage;

pub use engine::{default_workflow, Workflow, WorkflowRegistry, DEFAULT_WORKFLOW};
pub use stage::{ActionCtx, ActionError, Stage, StageAction};
