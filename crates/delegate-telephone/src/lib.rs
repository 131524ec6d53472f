//! # Delegate Telephone
//!
//! A Telephone is a bounded-context persistent conversation backed by
//! one LLM-agent subprocess. It owns the subprocess lifecycle, tracks
//! token and cost usage, enforces tool permissions, and auto-rotates
//! (summarize, persist memory, reset) when the context budget fills.
//!
//! The exchange is the process-scoped registry of Telephones keyed by
//! `(team, agent)`, plus the per-task worktree locks that serialize
//! agent turns against the merge worker.

pub mod exchange;
pub mod guard;
pub mod process;
pub mod sdk;
pub mod telephone;
pub mod testing;
pub mod usage;

pub use exchange::{TelephoneExchange, WorktreeLock, WORKTREE_LOCK_TIMEOUT};
pub use guard::GuardConfig;
pub use process::ProcessConnector;
pub use sdk::{ContentBlock, PermissionDecision, SdkClient, SdkConnector, SdkMessage, SdkOptions};
pub use telephone::{Telephone, TelephoneConfig, DEFAULT_MAX_CONTEXT_TOKENS};
pub use usage::Usage;
