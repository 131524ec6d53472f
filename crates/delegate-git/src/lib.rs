//! # Delegate Git
//!
//! Wrappers over the git CLI: registered-repo symlinks, per-task
//! worktree lifecycle, and environment-script generation. The merge
//! worker builds on the same command wrapper.

pub mod cmd;
pub mod envscripts;
pub mod repo;
pub mod worktree;

pub use cmd::{git, git_in, git_stdin, GitOutput};
pub use repo::{get_repo_path, register_repo, update_repo_path};
pub use worktree::{
    cancel_task, create_task_worktree, other_unmerged_tasks_on_branch, remove_task_worktree,
};
