//! Execution lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle of one notebook execution.
///
/// ```text
/// NotStarted ──► Running ──► Completed
///     │             └──────► Failed
///     └────────────────────► Skipped
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    #[default]
    NotStarted,
    /// Code cells are being executed in document order.
    Running,
    /// Every cell was processed, possibly with recorded errors.
    Completed,
    /// A cell failure aborted the remaining cells.
    Failed,
    /// Nothing was executed: excluded, satisfied, or served from the cache.
    Skipped,
}

impl ExecutionState {
    /// Whether the state is final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Skipped
        )
    }

    /// Whether `next` is reachable from `self` in one step.
    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (NotStarted, Running)
                | (NotStarted, Skipped)
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    /// Move to `next`.
    ///
    /// # Panics
    ///
    /// In debug builds, if the transition is not allowed.
    pub(crate) fn advance(&mut self, next: ExecutionState) {
        debug_assert!(
            self.can_transition_to(next),
            "invalid execution state transition {:?} -> {:?}",
            self,
            next
        );
        *self = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use ExecutionState::*;
        assert!(NotStarted.can_transition_to(Running));
        assert!(NotStarted.can_transition_to(Skipped));
        assert!(Running.can_transition_to(Failed));
        assert!(!Skipped.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!NotStarted.can_transition_to(Completed));
    }

    #[test]
    fn test_terminal() {
        assert!(!ExecutionState::Running.is_terminal());
        assert!(ExecutionState::Skipped.is_terminal());

        let mut state = ExecutionState::default();
        state.advance(ExecutionState::Running);
        state.advance(ExecutionState::Completed);
        assert!(state.is_terminal());
    }
}
