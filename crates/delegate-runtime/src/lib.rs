//! # Delegate Runtime
//!
//! The turn runtime: for one agent, select a message batch, resolve
//! the workspace, build the prompt, stream a turn through the agent's
//! Telephone, record the session, and optionally reflect. The daemon
//! dispatches one `run_turn` per agent with unread mail.

pub mod activity;
pub mod batch;
pub mod prompt;
pub mod turn;
pub mod workspace;

pub use activity::{ActivityEvent, ActivityHub};
pub use batch::{select_batch, MAX_BATCH_SIZE};
pub use turn::{list_ai_agents, Runtime, TurnResult, DISALLOWED_TOOLS, REFLECTION_PROBABILITY};
pub use workspace::resolve_workspace;
