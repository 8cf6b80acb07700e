//! Typed task unit and its type-erased scheduler interface.
//!
//! [`Task<I, O>`] is parametric in the caller's input and output types; the
//! manager only sees the object-safe [`Runnable`] trait, so a heterogeneous
//! task set can coexist with strongly-typed tasks. Callers keep their typed
//! `Arc<Task<I, O>>` handle and read state, result and error from it after
//! the run.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{TaskError, panic_to_error};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::state::{CallbackState, DependMode, TaskRecord, TaskState};

/// Worker function: receives a cancellation-aware scope and the task input.
pub type Worker<I, O> =
    Arc<dyn Fn(CancellationToken, I) -> BoxFuture<'static, Result<O, TaskError>> + Send + Sync>;

/// Success callback: post-processes the worker's output. Its `Ok` replaces
/// the stored result; its failure is tracked separately from the task state.
pub type Callback<O> =
    Arc<dyn Fn(O) -> BoxFuture<'static, Result<O, TaskError>> + Send + Sync>;

const POISONED: &str = "task cell poisoned";

struct TaskCell<O> {
    state: TaskState,
    result: Option<O>,
    error: Option<TaskError>,
    retry_count: u32,
    callback_state: CallbackState,
    callback_error: Option<TaskError>,
    token: Option<CancellationToken>,
}

impl<O> TaskCell<O> {
    fn new() -> Self {
        Self {
            state: TaskState::Pending,
            result: None,
            error: None,
            retry_count: 0,
            callback_state: CallbackState::NotRun,
            callback_error: None,
            token: None,
        }
    }
}

/// A named unit of work with a worker, retry policy, priority and optional
/// success callback.
///
/// Construction is builder-style:
///
/// ```
/// use dagflow::{Task, TaskError};
/// use tokio_util::sync::CancellationToken;
///
/// let task = Task::new("double", 21i64, |_ctx: CancellationToken, input| async move {
///     Ok::<_, TaskError>(input * 2)
/// })
/// .with_priority(5)
/// .build();
///
/// assert_eq!(task.name(), "double");
/// ```
pub struct Task<I, O> {
    name: String,
    input: I,
    worker: Worker<I, O>,
    callback: Option<Callback<O>>,
    priority: i32,
    retry: RetryPolicy,
    depend_mode: DependMode,
    cancel_flag: AtomicBool,
    cell: Mutex<TaskCell<O>>,
}

impl<I, O> Task<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Serialize + Send + Sync + 'static,
{
    /// Creates a task with default priority `0`, no retries and concurrent
    /// dependency launch.
    pub fn new<F, Fut>(name: impl Into<String>, input: I, worker: F) -> Self
    where
        F: Fn(CancellationToken, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, TaskError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            input,
            worker: Arc::new(move |ctx, input| worker(ctx, input).boxed()),
            callback: None,
            priority: 0,
            retry: RetryPolicy::default(),
            depend_mode: DependMode::default(),
            cancel_flag: AtomicBool::new(false),
            cell: Mutex::new(TaskCell::new()),
        }
    }

    /// Higher priority launches earlier among ready peers.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy.normalized();
        self
    }

    pub fn with_depend_mode(mut self, mode: DependMode) -> Self {
        self.depend_mode = mode;
        self
    }

    /// Invoked only after the worker succeeds; see [`Callback`].
    pub fn with_callback<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(O) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, TaskError>> + Send + 'static,
    {
        self.callback = Some(Arc::new(move |output| callback(output).boxed()));
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn state(&self) -> TaskState {
        self.cell.lock().expect(POISONED).state
    }

    /// The stored result; populated on success, possibly replaced by the
    /// callback's output.
    pub fn result(&self) -> Option<O> {
        self.cell.lock().expect(POISONED).result.clone()
    }

    /// Final error after retries were exhausted, or the dependency failure
    /// that prevented the task from running.
    pub fn error(&self) -> Option<TaskError> {
        self.cell.lock().expect(POISONED).error.clone()
    }

    /// Retries actually performed; never exceeds the policy's `max_retries`.
    pub fn retry_count(&self) -> u32 {
        self.cell.lock().expect(POISONED).retry_count
    }

    pub fn callback_state(&self) -> CallbackState {
        self.cell.lock().expect(POISONED).callback_state
    }

    pub fn callback_error(&self) -> Option<TaskError> {
        self.cell.lock().expect(POISONED).callback_error.clone()
    }

    /// Immutable snapshot of the task's current outcome.
    pub fn snapshot(&self) -> TaskRecord {
        let cell = self.cell.lock().expect(POISONED);
        TaskRecord {
            name: self.name.clone(),
            state: cell.state,
            result: cell
                .result
                .as_ref()
                .and_then(|value| serde_json::to_value(value).ok()),
            error: cell.error.as_ref().map(ToString::to_string),
            retry_count: cell.retry_count,
            callback_state: cell.callback_state,
            callback_error: cell.callback_error.as_ref().map(ToString::to_string),
        }
    }

    async fn run_callback(&self, output: O) -> (O, CallbackState, Option<TaskError>) {
        let Some(callback) = &self.callback else {
            return (output, CallbackState::NotRun, None);
        };
        let fut = (callback)(output.clone());
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(replaced)) => (replaced, CallbackState::Completed, None),
            Ok(Err(err)) => (output, CallbackState::Failed, Some(err)),
            Err(payload) => (output, CallbackState::Failed, Some(panic_to_error(payload))),
        }
    }
}

/// Object-safe view of a task used by the scheduler.
///
/// State mutation goes exclusively through these methods and keeps
/// transitions monotonic: `Pending -> {Running, Cancelled, Failed}`,
/// `Running -> {Completed, Failed}`.
#[async_trait]
pub(crate) trait Runnable: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32;
    fn depend_mode(&self) -> DependMode;
    fn state(&self) -> TaskState;
    fn last_error(&self) -> Option<String>;
    fn snapshot(&self) -> TaskRecord;

    /// Flags the task for cancellation and signals its worker scope when one
    /// is already running.
    fn request_cancel(&self);
    fn cancel_requested(&self) -> bool;

    /// `Pending -> Cancelled`; no-op in any other state.
    fn mark_cancelled(&self);
    /// `Pending -> Failed` with `err`; no-op in any other state.
    fn fail(&self, err: TaskError);

    /// Runs the worker through the retry policy, then the success callback.
    /// Returns the terminal state reached.
    async fn execute(&self, ctx: CancellationToken) -> TaskState;
}

#[async_trait]
impl<I, O> Runnable for Task<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Serialize + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn depend_mode(&self) -> DependMode {
        self.depend_mode
    }

    fn state(&self) -> TaskState {
        Task::state(self)
    }

    fn last_error(&self) -> Option<String> {
        self.cell
            .lock()
            .expect(POISONED)
            .error
            .as_ref()
            .map(ToString::to_string)
    }

    fn snapshot(&self) -> TaskRecord {
        Task::snapshot(self)
    }

    fn request_cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
        let cell = self.cell.lock().expect(POISONED);
        if let Some(token) = &cell.token {
            token.cancel();
        }
    }

    fn cancel_requested(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    fn mark_cancelled(&self) {
        let mut cell = self.cell.lock().expect(POISONED);
        if cell.state == TaskState::Pending {
            cell.state = TaskState::Cancelled;
        }
    }

    fn fail(&self, err: TaskError) {
        let mut cell = self.cell.lock().expect(POISONED);
        if cell.state == TaskState::Pending {
            cell.state = TaskState::Failed;
            cell.error = Some(err);
        }
    }

    async fn execute(&self, ctx: CancellationToken) -> TaskState {
        if self.cancel_requested() {
            self.mark_cancelled();
            return Task::state(self);
        }

        {
            let mut cell = self.cell.lock().expect(POISONED);
            if cell.state != TaskState::Pending {
                return cell.state;
            }
            cell.state = TaskState::Running;
            cell.token = Some(ctx.clone());
        }

        let executor = RetryExecutor::new(self.retry.clone());
        let worker = self.worker.clone();
        let input = self.input.clone();
        let worker_ctx = ctx.clone();
        let (outcome, retries) = executor
            .run(&ctx, move |_attempt| {
                let fut = (worker)(worker_ctx.clone(), input.clone());
                async move {
                    match AssertUnwindSafe(fut).catch_unwind().await {
                        Ok(res) => res,
                        Err(payload) => Err(panic_to_error(payload)),
                    }
                }
            })
            .await;

        match outcome {
            Ok(output) => {
                let (result, callback_state, callback_error) = self.run_callback(output).await;
                let mut cell = self.cell.lock().expect(POISONED);
                cell.state = TaskState::Completed;
                cell.result = Some(result);
                cell.retry_count = retries;
                cell.callback_state = callback_state;
                cell.callback_error = callback_error;
                TaskState::Completed
            }
            Err(err) => {
                let mut cell = self.cell.lock().expect(POISONED);
                cell.state = TaskState::Failed;
                cell.error = Some(err);
                cell.retry_count = retries;
                TaskState::Failed
            }
        }
    }
}
