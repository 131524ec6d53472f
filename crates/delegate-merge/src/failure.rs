//! Merge failure taxonomy and the structured merge result.

use delegate_core::paths::format_task_id;

/// Structured reasons for merge failures. `retryable` drives the
/// routing policy in `merge_once`: retryable failures are silently
/// retried up to the attempt cap; the rest escalate immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeFailureReason {
    RebaseConflict,
    SquashConflict,
    PreMergeFailed,
    WorktreeError,
    DirtyMain,
    FfNotPossible,
    UpdateRefFailed,
}

impl MergeFailureReason {
    pub fn short_message(&self) -> &'static str {
        match self {
            Self::RebaseConflict => "Rebase conflict",
            Self::SquashConflict => "True content conflict",
            Self::PreMergeFailed => "Pre-merge checks failed",
            Self::WorktreeError => "Could not create merge worktree",
            Self::DirtyMain => "main has uncommitted changes",
            Self::FfNotPossible => "Fast-forward not possible",
            Self::UpdateRefFailed => "Atomic ref update failed",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::WorktreeError | Self::DirtyMain | Self::FfNotPossible | Self::UpdateRefFailed
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RebaseConflict => "REBASE_CONFLICT",
            Self::SquashConflict => "SQUASH_CONFLICT",
            Self::PreMergeFailed => "PRE_MERGE_FAILED",
            Self::WorktreeError => "WORKTREE_ERROR",
            Self::DirtyMain => "DIRTY_MAIN",
            Self::FfNotPossible => "FF_NOT_POSSIBLE",
            Self::UpdateRefFailed => "UPDATE_REF_FAILED",
        }
    }
}

/// Result of one merge attempt. `merge_task` never mutates task status
/// itself; the caller routes this result.
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub task_id: i64,
    pub success: bool,
    pub message: String,
    /// `None` on success.
    pub reason: Option<MergeFailureReason>,
    /// Human-readable conflicting-file context for squash conflicts.
    pub conflict_context: String,
}

impl MergeResult {
    pub fn ok(task_id: i64, message: impl Into<String>) -> Self {
        Self {
            task_id,
            success: true,
            message: message.into(),
            reason: None,
            conflict_context: String::new(),
        }
    }

    pub fn fail(task_id: i64, reason: MergeFailureReason, message: impl Into<String>) -> Self {
        Self {
            task_id,
            success: false,
            message: message.into(),
            reason: Some(reason),
            conflict_context: String::new(),
        }
    }

    pub fn with_conflict_context(mut self, context: impl Into<String>) -> Self {
        self.conflict_context = context.into();
        self
    }

    pub fn retryable(&self) -> bool {
        self.reason.map(|r| r.retryable()).unwrap_or(false)
    }
}

impl std::fmt::Display for MergeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.success { "OK" } else { "FAIL" };
        write!(f, "MergeResult({}, {status}", format_task_id(self.task_id))?;
        if let Some(reason) = self.reason {
            write!(f, ", reason={}", reason.name())?;
        }
        write!(f, ", {:?})", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_table() {
        assert!(!MergeFailureReason::RebaseConflict.retryable());
        assert!(!MergeFailureReason::SquashConflict.retryable());
        assert!(!MergeFailureReason::PreMergeFailed.retryable());
        assert!(MergeFailureReason::WorktreeError.retryable());
        assert!(MergeFailureReason::DirtyMain.retryable());
        assert!(MergeFailureReason::FfNotPossible.retryable());
        assert!(MergeFailureReason::UpdateRefFailed.retryable());
    }

    #[test]
    fn test_result_display() {
        let result = MergeResult::fail(7, MergeFailureReason::DirtyMain, "dirty");
        let shown = result.to_string();
        assert!(shown.contains("T0007"));
        assert!(shown.contains("FAIL"));
        assert!(shown.contains("DIRTY_MAIN"));
        assert!(result.retryable());

        let ok = MergeResult::ok(7, "merged");
        assert!(!ok.retryable());
        assert!(ok.to_string().contains("OK"));
    }
}
