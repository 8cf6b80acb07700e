use std::any::Any;

use thiserror::Error;

/// Structural mistakes made while building the task graph.
///
/// These are surfaced at wiring time and are not recoverable at run time:
/// the caller has to fix the graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WiringError {
    #[error("max concurrency must be at least 1")]
    InvalidConcurrency,
    #[error("task '{0}' is already registered and has not finished")]
    DuplicateTask(String),
    #[error("unknown task '{0}'")]
    UnknownTask(String),
    #[error("task '{0}' cannot depend on itself")]
    SelfDependency(String),
    #[error("dependency '{from}' -> '{to}' would close a cycle")]
    CircularDependency { from: String, to: String },
}

/// Errors produced while executing a task, its callback or a lifecycle hook.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The worker (or callback/hook) returned an error.
    #[error("{0}")]
    Execution(String),
    /// A caller-supplied callable panicked; the payload is stringified.
    #[error("panic: {0}")]
    Panic(String),
    /// A prerequisite ended in `Failed`.
    #[error("dependency '{dependency}' failed: {reason}")]
    DependencyFailed { dependency: String, reason: String },
    /// A prerequisite ended in `Cancelled`.
    #[error("dependency '{dependency}' was cancelled")]
    DependencyCancelled { dependency: String },
    /// The cancellation token was observed during execution or a retry wait.
    #[error("task cancelled")]
    Cancelled,
}

impl TaskError {
    /// Shortcut for the common worker-error case.
    pub fn execution(msg: impl Into<String>) -> Self {
        TaskError::Execution(msg.into())
    }
}

/// Errors returned by the FIFO and priority queues.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Dequeue from an empty queue. The queues never block; callers poll.
    #[error("queue is empty")]
    Empty,
    /// Enqueue into a full queue that is not allowed to grow.
    #[error("queue is full")]
    Full,
    /// The operation was aborted by a cancelled token.
    #[error("queue operation cancelled")]
    Cancelled,
}

/// Converts a recovered panic payload into a [`TaskError::Panic`].
pub(crate) fn panic_to_error(payload: Box<dyn Any + Send>) -> TaskError {
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    TaskError::Panic(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_failure_message_names_the_dependency() {
        let err = TaskError::DependencyFailed {
            dependency: "dep2".to_string(),
            reason: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "dependency 'dep2' failed: boom");
    }

    #[test]
    fn dependency_cancelled_message() {
        let err = TaskError::DependencyCancelled {
            dependency: "t1".to_string(),
        };
        assert_eq!(err.to_string(), "dependency 't1' was cancelled");
    }

    #[test]
    fn panic_payload_is_prefixed() {
        let err = panic_to_error(Box::new("kaboom"));
        assert_eq!(err.to_string(), "panic: kaboom");

        let err = panic_to_error(Box::new("owned".to_string()));
        assert_eq!(err.to_string(), "panic: owned");
    }
}
