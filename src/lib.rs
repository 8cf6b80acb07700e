//! dagflow runs directed acyclic graphs of async tasks.
//!
//! Build [`Task`]s, register them on a [`TaskManager`], wire dependencies,
//! then [`TaskManager::run`] the batch under a cancellation scope. Tasks
//! carry their own priority, retry policy and success callback; the manager
//! bounds parallelism, propagates dependency failures and archives replaced
//! tasks into history.
//!
//! The scheduling primitives are exported on their own: [`ConcurrencyGate`],
//! [`FifoQueue`], [`PriorityQueue`] and [`FuncChain`] are usable outside the
//! manager.

pub mod chain;
pub mod cycle_check;
pub mod error;
pub mod fifo;
pub mod gate;
pub mod manager;
pub mod priority;
pub mod retry;
pub mod state;
pub mod task;

pub use chain::{FuncChain, FuncItem};
pub use cycle_check::has_cycle;
pub use error::{QueueError, TaskError, WiringError};
pub use fifo::{FifoConfig, FifoQueue};
pub use gate::ConcurrencyGate;
pub use manager::{Hook, TaskManager};
pub use priority::PriorityQueue;
pub use retry::{RetryExecutor, RetryPolicy};
pub use state::{CallbackState, DependMode, TaskRecord, TaskState};
pub use task::{Callback, Task, Worker};

use std::sync::Arc;

/// Shared handle to a typed task, as returned by [`Task::build`].
pub type TaskRef<I, O> = Arc<Task<I, O>>;
