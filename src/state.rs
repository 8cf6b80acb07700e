use serde::Serialize;

/// Lifecycle state of a task.
///
/// Transitions are monotonic: `Pending -> {Running, Cancelled, Failed}`,
/// `Running -> {Completed, Failed}`. The three terminal states never change.
/// A `Pending` task moves straight to `Failed` only when a dependency ended
/// in `Failed` or `Cancelled`; its worker is never invoked in that case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Outcome of the success callback, tracked separately from the task state.
///
/// A failing callback never flips its task out of `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum CallbackState {
    #[default]
    NotRun,
    Completed,
    Failed,
}

/// How a task's direct dependencies are launched once they become eligible.
///
/// `Concurrent` (the default) lets every ready dependency start in parallel,
/// subject only to the manager's global concurrency bound. `Sequential`
/// launches them one after another in declaration order; each still respects
/// its own dependencies. The mode orders launches only, it neither carries
/// failure nor affects the global bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependMode {
    Sequential,
    #[default]
    Concurrent,
}

/// Immutable snapshot of a task at (or after) terminal time.
///
/// Records are what the manager archives into history when a terminal task
/// is displaced by a replacement registered under the same name.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub name: String,
    pub state: TaskState,
    /// Result serialized to JSON; `None` when the task produced no result
    /// or the value did not serialize.
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub callback_state: CallbackState,
    pub callback_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }
}
