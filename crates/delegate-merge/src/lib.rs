//! # Delegate Merge
//!
//! The merge worker: for an approved task, rebase every repo in a
//! disposable worktree (with a squash-reapply fallback), reset the
//! agent worktree under the per-task lock, run pre-merge checks, and
//! fast-forward `main`. Failures are classified and either retried or
//! escalated to the manager.

pub mod failure;
pub mod worker;

pub use failure::{MergeFailureReason, MergeResult};
pub use worker::{MergeContext, MAX_MERGE_ATTEMPTS};
