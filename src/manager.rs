//! DAG task manager.
//!
//! Owns a set of named tasks plus their dependency edges and drives them to
//! terminal states: Kahn-style readiness tracking, admission through a
//! [`ConcurrencyGate`] sized at `max_concurrency`, a [`PriorityQueue`] for
//! the ready set (higher task priority first, registration order among
//! equals), retries and callbacks on the tasks themselves, and transitive
//! failure propagation when a dependency ends in `Failed` or `Cancelled`.
//!
//! The manager never aborts a batch because one task failed: every task
//! reaches some terminal state before [`TaskManager::run`] returns, and the
//! caller inspects each task afterwards.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chain::{FuncChain, FuncItem};
use crate::cycle_check::creates_cycle;
use crate::error::{TaskError, WiringError};
use crate::gate::ConcurrencyGate;
use crate::priority::PriorityQueue;
use crate::state::{DependMode, TaskRecord, TaskState};
use crate::task::{Runnable, Task};

/// Lifecycle hook run before (`with_startup_hook`) or after
/// (`with_shutdown_hook`) a batch.
pub type Hook = Arc<dyn Fn() -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync>;

const LOCK: &str = "manager lock poisoned";

#[derive(Default)]
struct GraphState {
    tasks: HashMap<String, Arc<dyn Runnable>>,
    /// Registration order; drives tie-breaking among equal priorities.
    order: Vec<String>,
    /// task name -> names it depends on, in declaration order.
    deps: HashMap<String, Vec<String>>,
    /// dependency name -> names depending on it.
    dependents: HashMap<String, Vec<String>>,
}

/// Container and scheduler for a DAG of [`Task`]s.
///
/// ```
/// use dagflow::{Task, TaskError, TaskManager, TaskState};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = TaskManager::new(2)?;
/// let fetch = Task::new("fetch", 3u32, |_ctx, n| async move { Ok::<_, TaskError>(n + 1) }).build();
/// let store = Task::new("store", 0u32, |_ctx, n| async move { Ok::<_, TaskError>(n) }).build();
/// manager.add_task(fetch.clone())?;
/// manager.add_task(store.clone())?;
/// manager.add_dependency("store", "fetch")?;
///
/// manager.run(CancellationToken::new()).await?;
/// assert_eq!(fetch.state(), TaskState::Completed);
/// assert_eq!(manager.execution_order(), vec!["fetch", "store"]);
/// # Ok(())
/// # }
/// ```
pub struct TaskManager {
    max_concurrency: usize,
    graph: RwLock<GraphState>,
    history: RwLock<HashMap<String, Vec<TaskRecord>>>,
    completed: Mutex<Vec<String>>,
    startup_hook: Option<Hook>,
    shutdown_hook: Option<Hook>,
}

impl TaskManager {
    /// Creates an empty manager bounding simultaneously running workers at
    /// `max_concurrency` (must be at least 1).
    pub fn new(max_concurrency: usize) -> Result<Self, WiringError> {
        if max_concurrency == 0 {
            return Err(WiringError::InvalidConcurrency);
        }
        Ok(Self {
            max_concurrency,
            graph: RwLock::new(GraphState::default()),
            history: RwLock::new(HashMap::new()),
            completed: Mutex::new(Vec::new()),
            startup_hook: None,
            shutdown_hook: None,
        })
    }

    /// Runs before the batch; an error (or panic) skips the batch entirely.
    pub fn with_startup_hook<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.startup_hook = Some(Arc::new(move || hook().boxed()));
        self
    }

    /// Runs after every task is terminal, regardless of task outcomes.
    pub fn with_shutdown_hook<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.shutdown_hook = Some(Arc::new(move || hook().boxed()));
        self
    }

    /// Registers `task` under its name.
    ///
    /// Re-adding a name whose prior task already reached a terminal state
    /// archives that task's snapshot into history and replaces it. A live
    /// prior task is a wiring error.
    pub fn add_task<I, O>(&self, task: Arc<Task<I, O>>) -> Result<(), WiringError>
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + serde::Serialize + Send + Sync + 'static,
    {
        let name = task.name().to_string();
        let runnable: Arc<dyn Runnable> = task;
        let mut g = self.graph.write().expect(LOCK);
        if let Some(existing) = g.tasks.get(&name) {
            if !existing.state().is_terminal() {
                return Err(WiringError::DuplicateTask(name));
            }
            let record = existing.snapshot();
            self.history
                .write()
                .expect(LOCK)
                .entry(name.clone())
                .or_default()
                .push(record);
            g.tasks.insert(name, runnable);
        } else {
            g.order.push(name.clone());
            g.tasks.insert(name, runnable);
        }
        Ok(())
    }

    /// Records `depends_on` as a prerequisite of `name`.
    ///
    /// Self-edges and edges that would close a cycle in the current graph are
    /// rejected; both tasks must already be registered. Duplicate edges are
    /// ignored.
    pub fn add_dependency(&self, name: &str, depends_on: &str) -> Result<(), WiringError> {
        let mut g = self.graph.write().expect(LOCK);
        if !g.tasks.contains_key(name) {
            return Err(WiringError::UnknownTask(name.to_string()));
        }
        if !g.tasks.contains_key(depends_on) {
            return Err(WiringError::UnknownTask(depends_on.to_string()));
        }
        if name == depends_on {
            return Err(WiringError::SelfDependency(name.to_string()));
        }
        if creates_cycle(&g.deps, name, depends_on) {
            return Err(WiringError::CircularDependency {
                from: name.to_string(),
                to: depends_on.to_string(),
            });
        }

        let deps = g.deps.entry(name.to_string()).or_default();
        if !deps.iter().any(|d| d == depends_on) {
            deps.push(depends_on.to_string());
            g.dependents
                .entry(depends_on.to_string())
                .or_default()
                .push(name.to_string());
        }
        Ok(())
    }

    /// Marks the named task for cancellation.
    ///
    /// A still-Pending task becomes Cancelled without its worker running; a
    /// Running task has its worker scope signalled; a terminal task is left
    /// alone. Returns `false` for unknown names.
    pub fn cancel(&self, name: &str) -> bool {
        let g = self.graph.read().expect(LOCK);
        match g.tasks.get(name) {
            Some(task) => {
                debug!(task = %name, "cancellation requested");
                task.request_cancel();
                true
            }
            None => false,
        }
    }

    /// [`cancel`](TaskManager::cancel) over every registered task.
    pub fn cancel_all(&self) {
        let g = self.graph.read().expect(LOCK);
        for task in g.tasks.values() {
            task.request_cancel();
        }
    }

    /// Archived attempts for tasks that shared `name` and were displaced by a
    /// replacement. The current live task is not part of its own history.
    pub fn task_history(&self, name: &str) -> Vec<TaskRecord> {
        self.history
            .read()
            .expect(LOCK)
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn task_state(&self, name: &str) -> Option<TaskState> {
        self.graph
            .read()
            .expect(LOCK)
            .tasks
            .get(name)
            .map(|task| task.state())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.graph.read().expect(LOCK).tasks.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.graph.read().expect(LOCK).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Task names in completion order of the most recent run.
    pub fn execution_order(&self) -> Vec<String> {
        self.completed.lock().expect(LOCK).clone()
    }

    /// Renders the dependency graph, roots first, dependents indented.
    pub fn graph(&self) -> String {
        let g = self.graph.read().expect(LOCK);
        let mut out = String::new();
        for name in &g.order {
            let is_root = g.deps.get(name).is_none_or(|d| d.is_empty());
            if !is_root {
                continue;
            }
            out.push_str(name);
            out.push('\n');
            render_dependents(&g.dependents, name, "  ", &mut out);
        }
        out
    }

    /// Drives every registered task to a terminal state.
    ///
    /// The startup hook runs first; if it fails the batch is skipped and the
    /// error propagated. Task failures never fail the run itself; inspect
    /// each task afterwards. The shutdown hook runs once every task is
    /// terminal; its error is propagated after the batch.
    pub async fn run(&self, ctx: CancellationToken) -> Result<(), TaskError> {
        self.run_hook(self.startup_hook.as_ref()).await?;
        self.execute_graph(ctx).await;
        self.run_hook(self.shutdown_hook.as_ref()).await?;
        Ok(())
    }

    async fn run_hook(&self, hook: Option<&Hook>) -> Result<(), TaskError> {
        let Some(hook) = hook else {
            return Ok(());
        };
        let hook = hook.clone();
        let mut chain = FuncChain::new();
        chain.add_func_item(FuncItem::new(0, move || (hook)()));
        chain.execute().await;
        match chain.func_items().first().and_then(|item| item.error()) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn execute_graph(&self, ctx: CancellationToken) {
        let (tasks, order, deps, dependents) = {
            let g = self.graph.read().expect(LOCK);
            (
                g.tasks.clone(),
                g.order.clone(),
                g.deps.clone(),
                g.dependents.clone(),
            )
        };
        self.completed.lock().expect(LOCK).clear();
        if tasks.is_empty() {
            return;
        }

        // Hard edges gate on Completed dependencies; soft edges only order
        // the launches of a Sequential task's dependency frontier.
        let mut hard: HashMap<String, usize> = HashMap::new();
        let mut soft: HashMap<String, usize> = HashMap::new();
        let mut soft_successors: HashMap<String, Vec<String>> = HashMap::new();
        for name in &order {
            hard.insert(name.clone(), deps.get(name).map_or(0, Vec::len));
            soft.entry(name.clone()).or_insert(0);
        }
        for name in &order {
            let Some(task) = tasks.get(name) else { continue };
            if task.depend_mode() != DependMode::Sequential {
                continue;
            }
            if let Some(list) = deps.get(name) {
                for pair in list.windows(2) {
                    soft_successors
                        .entry(pair[0].clone())
                        .or_default()
                        .push(pair[1].clone());
                    *soft.entry(pair[1].clone()).or_insert(0) += 1;
                }
            }
        }

        let mut dispatch = Dispatch {
            tasks,
            dependents,
            soft_successors,
            hard,
            soft,
            ready: PriorityQueue::new(),
            queue_ctx: CancellationToken::new(),
            remaining: 0,
            completed: Vec::new(),
        };

        for name in &order {
            if dispatch
                .tasks
                .get(name)
                .is_some_and(|t| t.state() == TaskState::Pending)
            {
                dispatch.remaining += 1;
            }
        }

        // Seed the ready set in registration order, then fold in the effects
        // of tasks left terminal by a previous run.
        for name in &order {
            dispatch.push_if_ready(name);
        }
        let leftovers: Vec<String> = order
            .iter()
            .filter(|n| {
                dispatch
                    .tasks
                    .get(*n)
                    .is_some_and(|t| t.state().is_terminal())
            })
            .cloned()
            .collect();
        for name in &leftovers {
            dispatch.settle(name, false);
        }

        // Tasks flagged before the run become Cancelled without launching.
        for name in &order {
            let Some(task) = dispatch.tasks.get(name) else { continue };
            if task.state() == TaskState::Pending && task.cancel_requested() {
                task.mark_cancelled();
                dispatch.settle(name, true);
            }
        }

        let gate = ConcurrencyGate::new(self.max_concurrency);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();
        let mut launched: HashSet<String> = HashSet::new();
        let mut root_cancelled = false;

        while dispatch.remaining > 0 {
            // Admit everything currently ready, highest priority first.
            while let Ok(name) = dispatch.ready.dequeue(&dispatch.queue_ctx) {
                let Some(task) = dispatch.tasks.get(&name).cloned() else {
                    continue;
                };
                if task.state() != TaskState::Pending || !launched.insert(name.clone()) {
                    continue;
                }
                if task.cancel_requested() {
                    task.mark_cancelled();
                    dispatch.settle(&name, true);
                    continue;
                }

                debug!(task = %name, "launching task");
                let child = ctx.child_token();
                let tx = done_tx.clone();
                let task_name = name.clone();
                gate.spawn(async move {
                    let state = task.execute(child).await;
                    debug!(task = %task_name, state = ?state, "task reached terminal state");
                    let _ = tx.send(task_name);
                    Ok(())
                })
                .await;
            }

            if dispatch.remaining == 0 {
                break;
            }

            if root_cancelled {
                match done_rx.recv().await {
                    Some(name) => dispatch.settle(&name, true),
                    None => break,
                }
            } else {
                tokio::select! {
                    settled = done_rx.recv() => {
                        if let Some(name) = settled {
                            dispatch.settle(&name, true);
                        }
                    }
                    _ = ctx.cancelled() => {
                        debug!("root scope cancelled; cancelling pending tasks");
                        root_cancelled = true;
                        // Launched tasks settle through the channel exactly
                        // once; only unlaunched ones are settled here.
                        for name in &order {
                            let Some(task) = dispatch.tasks.get(name) else { continue };
                            if launched.contains(name) {
                                task.request_cancel();
                                continue;
                            }
                            if task.state() == TaskState::Pending {
                                task.mark_cancelled();
                                dispatch.settle(name, true);
                            }
                        }
                    }
                }
            }
        }

        // Workers have all reported; the gate drains immediately.
        if let Err(err) = gate.wait().await {
            debug!(error = %err, "gate recorded a worker error");
        }

        *self.completed.lock().expect(LOCK) = dispatch.completed;
    }
}

/// Single-owner scheduling state for one `run`.
struct Dispatch {
    tasks: HashMap<String, Arc<dyn Runnable>>,
    dependents: HashMap<String, Vec<String>>,
    soft_successors: HashMap<String, Vec<String>>,
    hard: HashMap<String, usize>,
    soft: HashMap<String, usize>,
    ready: PriorityQueue<String>,
    queue_ctx: CancellationToken,
    remaining: usize,
    completed: Vec<String>,
}

impl Dispatch {
    fn push_if_ready(&self, name: &str) {
        let Some(task) = self.tasks.get(name) else {
            return;
        };
        if task.state() != TaskState::Pending {
            return;
        }
        if self.hard.get(name).copied().unwrap_or(0) != 0 {
            return;
        }
        if self.soft.get(name).copied().unwrap_or(0) != 0 {
            return;
        }
        let _ = self
            .ready
            .enqueue(&self.queue_ctx, name.to_string(), task.priority());
    }

    /// Processes a task that just reached a terminal state: releases soft
    /// ordering edges, unblocks or transitively fails hard dependents.
    ///
    /// `counted` is false only for tasks that were already terminal when the
    /// run started; their edges still propagate but they are not part of
    /// this run's accounting.
    fn settle(&mut self, name: &str, counted: bool) {
        let mut work: Vec<(String, bool)> = vec![(name.to_string(), counted)];
        while let Some((name, counted)) = work.pop() {
            let state = match self.tasks.get(&name) {
                Some(task) => task.state(),
                None => continue,
            };
            if counted {
                self.remaining = self.remaining.saturating_sub(1);
                if state == TaskState::Completed {
                    self.completed.push(name.clone());
                }
            }

            if let Some(successors) = self.soft_successors.get(&name).cloned() {
                for successor in successors {
                    if let Some(count) = self.soft.get_mut(&successor) {
                        *count = count.saturating_sub(1);
                    }
                    self.push_if_ready(&successor);
                }
            }

            match state {
                TaskState::Completed => {
                    if let Some(dependents) = self.dependents.get(&name).cloned() {
                        for dependent in dependents {
                            if let Some(count) = self.hard.get_mut(&dependent) {
                                *count = count.saturating_sub(1);
                            }
                            self.push_if_ready(&dependent);
                        }
                    }
                }
                TaskState::Failed | TaskState::Cancelled => {
                    let reason = self
                        .tasks
                        .get(&name)
                        .and_then(|task| task.last_error())
                        .unwrap_or_else(|| "failed".to_string());
                    if let Some(dependents) = self.dependents.get(&name).cloned() {
                        for dependent in dependents {
                            let Some(task) = self.tasks.get(&dependent) else {
                                continue;
                            };
                            if task.state() != TaskState::Pending {
                                continue;
                            }
                            let err = if state == TaskState::Cancelled {
                                TaskError::DependencyCancelled {
                                    dependency: name.clone(),
                                }
                            } else {
                                TaskError::DependencyFailed {
                                    dependency: name.clone(),
                                    reason: reason.clone(),
                                }
                            };
                            task.fail(err);
                            work.push((dependent, true));
                        }
                    }
                }
                // Settle is only called for terminal tasks.
                TaskState::Pending | TaskState::Running => {}
            }
        }
    }
}

fn render_dependents(
    dependents: &HashMap<String, Vec<String>>,
    name: &str,
    prefix: &str,
    out: &mut String,
) {
    if let Some(children) = dependents.get(name) {
        for child in children {
            out.push_str(&format!("{prefix}└─> {child}\n"));
            render_dependents(dependents, child, &format!("{prefix}    "), out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    fn root() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn linear_chain_completes_in_order() {
        let manager = TaskManager::new(4).unwrap();
        let a = Task::new("a", 1u32, |_ctx, n| async move { Ok(n * 2) }).build();
        let b = Task::new("b", 2u32, |_ctx, n| async move { Ok(n * 2) }).build();
        let c = Task::new("c", 4u32, |_ctx, n| async move { Ok(n * 2) }).build();
        manager.add_task(a.clone()).unwrap();
        manager.add_task(b.clone()).unwrap();
        manager.add_task(c.clone()).unwrap();
        manager.add_dependency("b", "a").unwrap();
        manager.add_dependency("c", "b").unwrap();

        manager.run(root()).await.unwrap();

        assert_eq!(a.result(), Some(2));
        assert_eq!(b.result(), Some(4));
        assert_eq!(c.result(), Some(8));
        assert_eq!(manager.execution_order(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn diamond_respects_dependencies() {
        let manager = TaskManager::new(2).unwrap();
        for name in ["a", "b", "c", "d"] {
            let task = Task::new(name, (), |_ctx, _| async move {
                sleep(Duration::from_millis(5)).await;
                Ok(0u32)
            })
            .build();
            manager.add_task(task).unwrap();
        }
        manager.add_dependency("b", "a").unwrap();
        manager.add_dependency("c", "a").unwrap();
        manager.add_dependency("d", "b").unwrap();
        manager.add_dependency("d", "c").unwrap();

        manager.run(root()).await.unwrap();

        let order = manager.execution_order();
        assert_eq!(order.len(), 4);
        assert_eq!(order.first().map(String::as_str), Some("a"));
        assert_eq!(order.last().map(String::as_str), Some("d"));
        for name in ["a", "b", "c", "d"] {
            assert_eq!(manager.task_state(name), Some(TaskState::Completed));
        }
    }

    #[tokio::test]
    async fn dependency_failure_propagates_with_reason() {
        let manager = TaskManager::new(4).unwrap();
        let dep1 = Task::new("dep1", (), |_ctx, _| async move { Ok(1u32) }).build();
        let dep2 = Task::new("dep2", (), |_ctx, _| async move {
            Err::<u32, _>(TaskError::execution("boom"))
        })
        .build();
        let invoked = Arc::new(AtomicBool::new(false));
        let seen = invoked.clone();
        let main = Task::new("main", (), move |_ctx, _| {
            let seen = seen.clone();
            async move {
                seen.store(true, Ordering::SeqCst);
                Ok(0u32)
            }
        })
        .build();
        manager.add_task(dep1).unwrap();
        manager.add_task(dep2).unwrap();
        manager.add_task(main.clone()).unwrap();
        manager.add_dependency("main", "dep1").unwrap();
        manager.add_dependency("main", "dep2").unwrap();

        manager.run(root()).await.unwrap();

        assert_eq!(main.state(), TaskState::Failed);
        assert!(!invoked.load(Ordering::SeqCst), "worker must not run");
        assert_eq!(
            main.error().unwrap().to_string(),
            "dependency 'dep2' failed: boom"
        );
    }

    #[tokio::test]
    async fn failure_cascades_transitively() {
        let manager = TaskManager::new(2).unwrap();
        let a = Task::new("a", (), |_ctx, _| async move {
            Err::<u32, _>(TaskError::execution("root cause"))
        })
        .build();
        let b = Task::new("b", (), |_ctx, _| async move { Ok(0u32) }).build();
        let c = Task::new("c", (), |_ctx, _| async move { Ok(0u32) }).build();
        manager.add_task(a).unwrap();
        manager.add_task(b.clone()).unwrap();
        manager.add_task(c.clone()).unwrap();
        manager.add_dependency("b", "a").unwrap();
        manager.add_dependency("c", "b").unwrap();

        manager.run(root()).await.unwrap();

        assert_eq!(b.state(), TaskState::Failed);
        assert_eq!(
            b.error().unwrap().to_string(),
            "dependency 'a' failed: root cause"
        );
        assert_eq!(c.state(), TaskState::Failed);
        assert_eq!(
            c.error().unwrap().to_string(),
            "dependency 'b' failed: dependency 'a' failed: root cause"
        );
    }

    #[tokio::test]
    async fn circular_dependency_is_rejected() {
        let manager = TaskManager::new(1).unwrap();
        manager
            .add_task(Task::new("a", (), |_ctx, _| async move { Ok(0u32) }).build())
            .unwrap();
        manager
            .add_task(Task::new("b", (), |_ctx, _| async move { Ok(0u32) }).build())
            .unwrap();
        manager.add_dependency("a", "b").unwrap();

        assert_eq!(
            manager.add_dependency("b", "a"),
            Err(WiringError::CircularDependency {
                from: "b".to_string(),
                to: "a".to_string(),
            })
        );
        assert_eq!(manager.len(), 2, "registrations survive the rejection");
    }

    #[tokio::test]
    async fn unknown_and_self_dependencies_are_rejected() {
        let manager = TaskManager::new(1).unwrap();
        manager
            .add_task(Task::new("a", (), |_ctx, _| async move { Ok(0u32) }).build())
            .unwrap();

        assert_eq!(
            manager.add_dependency("a", "ghost"),
            Err(WiringError::UnknownTask("ghost".to_string()))
        );
        assert_eq!(
            manager.add_dependency("ghost", "a"),
            Err(WiringError::UnknownTask("ghost".to_string()))
        );
        assert_eq!(
            manager.add_dependency("a", "a"),
            Err(WiringError::SelfDependency("a".to_string()))
        );
    }

    #[tokio::test]
    async fn retries_are_exhausted_before_failing() {
        let manager = TaskManager::new(1).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let task = Task::new("flaky", (), move |_ctx, _| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>(TaskError::execution("still down"))
            }
        })
        .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(1), 3))
        .build();
        manager.add_task(task.clone()).unwrap();

        manager.run(root()).await.unwrap();

        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 4, "initial try plus 3 retries");
        assert_eq!(task.retry_count(), 3);
        assert_eq!(task.error(), Some(TaskError::execution("still down")));
    }

    #[tokio::test]
    async fn pre_run_cancel_skips_worker_and_fails_dependents() {
        let manager = TaskManager::new(2).unwrap();
        let invoked = Arc::new(AtomicBool::new(false));
        let seen = invoked.clone();
        let t1 = Task::new("t1", (), move |_ctx, _| {
            let seen = seen.clone();
            async move {
                seen.store(true, Ordering::SeqCst);
                Ok(0u32)
            }
        })
        .build();
        let t2 = Task::new("t2", (), |_ctx, _| async move { Ok(0u32) }).build();
        manager.add_task(t1.clone()).unwrap();
        manager.add_task(t2.clone()).unwrap();
        manager.add_dependency("t2", "t1").unwrap();

        assert!(manager.cancel("t1"));
        assert!(!manager.cancel("ghost"));
        manager.run(root()).await.unwrap();

        assert_eq!(t1.state(), TaskState::Cancelled);
        assert!(!invoked.load(Ordering::SeqCst));
        assert_eq!(
            t2.error(),
            Some(TaskError::DependencyCancelled {
                dependency: "t1".to_string(),
            })
        );
        assert_eq!(
            t2.error().unwrap().to_string(),
            "dependency 't1' was cancelled"
        );
    }

    #[tokio::test]
    async fn cancel_while_running_fails_with_cancelled() {
        let manager = Arc::new(TaskManager::new(1).unwrap());
        let task = Task::new("slow", (), |ctx: CancellationToken, _| async move {
            tokio::select! {
                _ = ctx.cancelled() => Err::<u32, _>(TaskError::Cancelled),
                _ = sleep(Duration::from_secs(30)) => Ok(1),
            }
        })
        .build();
        manager.add_task(task.clone()).unwrap();

        let runner = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.run(root()).await })
        };
        sleep(Duration::from_millis(20)).await;
        assert!(manager.cancel("slow"));
        runner.await.unwrap().unwrap();

        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(task.error(), Some(TaskError::Cancelled));
    }

    #[tokio::test]
    async fn root_token_cancels_pending_tasks() {
        let manager = Arc::new(TaskManager::new(1).unwrap());
        let slow = Task::new("slow", (), |ctx: CancellationToken, _| async move {
            tokio::select! {
                _ = ctx.cancelled() => Err::<u32, _>(TaskError::Cancelled),
                _ = sleep(Duration::from_secs(30)) => Ok(1),
            }
        })
        .build();
        let after = Task::new("after", (), |_ctx, _| async move { Ok(0u32) }).build();
        manager.add_task(slow.clone()).unwrap();
        manager.add_task(after.clone()).unwrap();
        manager.add_dependency("after", "slow").unwrap();

        let token = root();
        let runner = {
            let manager = manager.clone();
            let token = token.clone();
            tokio::spawn(async move { manager.run(token).await })
        };
        sleep(Duration::from_millis(20)).await;
        token.cancel();
        runner.await.unwrap().unwrap();

        assert_eq!(slow.state(), TaskState::Failed);
        assert_eq!(after.state(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn single_slot_honors_priorities() {
        let manager = TaskManager::new(1).unwrap();
        for (name, priority) in [("p1", 1), ("p5", 5), ("p3", 3)] {
            let task = Task::new(name, (), |_ctx, _| async move { Ok(0u32) })
                .with_priority(priority)
                .build();
            manager.add_task(task).unwrap();
        }

        manager.run(root()).await.unwrap();

        assert_eq!(manager.execution_order(), vec!["p5", "p3", "p1"]);
    }

    #[tokio::test]
    async fn running_tasks_never_exceed_the_bound() {
        let manager = TaskManager::new(2).unwrap();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for i in 0..6 {
            let current = current.clone();
            let peak = peak.clone();
            let task = Task::new(format!("t{i}"), (), move |_ctx, _| {
                let current = current.clone();
                let peak = peak.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(10)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(0u32)
                }
            })
            .build();
            manager.add_task(task).unwrap();
        }

        manager.run(root()).await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(manager.execution_order().len(), 6);
    }

    #[tokio::test]
    async fn sequential_mode_serializes_the_dependency_frontier() {
        let manager = TaskManager::new(4).unwrap();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for name in ["d1", "d2", "d3"] {
            let current = current.clone();
            let peak = peak.clone();
            let task = Task::new(name, (), move |_ctx, _| {
                let current = current.clone();
                let peak = peak.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(10)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(0u32)
                }
            })
            .build();
            manager.add_task(task).unwrap();
        }
        let sink = Task::new("sink", (), |_ctx, _| async move { Ok(0u32) })
            .with_depend_mode(DependMode::Sequential)
            .build();
        manager.add_task(sink.clone()).unwrap();
        manager.add_dependency("sink", "d1").unwrap();
        manager.add_dependency("sink", "d2").unwrap();
        manager.add_dependency("sink", "d3").unwrap();

        manager.run(root()).await.unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 1, "dependencies ran one at a time");
        assert_eq!(manager.execution_order(), vec!["d1", "d2", "d3", "sink"]);
        assert_eq!(sink.state(), TaskState::Completed);
    }

    #[tokio::test]
    async fn duplicate_live_task_is_rejected() {
        let manager = TaskManager::new(1).unwrap();
        manager
            .add_task(Task::new("job", (), |_ctx, _| async move { Ok(0u32) }).build())
            .unwrap();
        let second = Task::new("job", (), |_ctx, _| async move { Ok(1u32) }).build();
        assert_eq!(
            manager.add_task(second),
            Err(WiringError::DuplicateTask("job".to_string()))
        );
    }

    #[tokio::test]
    async fn replacing_a_finished_task_archives_it() {
        let manager = TaskManager::new(1).unwrap();
        manager
            .add_task(Task::new("job", (), |_ctx, _| async move { Ok(7u32) }).build())
            .unwrap();
        manager.run(root()).await.unwrap();
        assert!(manager.task_history("job").is_empty());

        let replacement = Task::new("job", (), |_ctx, _| async move { Ok(8u32) }).build();
        manager.add_task(replacement.clone()).unwrap();

        let history = manager.task_history("job");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, TaskState::Completed);
        assert_eq!(history[0].result, Some(serde_json::json!(7)));
        assert_eq!(manager.task_state("job"), Some(TaskState::Pending));

        manager.run(root()).await.unwrap();
        assert_eq!(replacement.result(), Some(8));
        assert_eq!(manager.task_history("job").len(), 1);
    }

    #[tokio::test]
    async fn startup_hook_failure_skips_the_batch() {
        let manager = TaskManager::new(1)
            .unwrap()
            .with_startup_hook(|| async { Err(TaskError::execution("no database")) });
        let task = Task::new("job", (), |_ctx, _| async move { Ok(0u32) }).build();
        manager.add_task(task.clone()).unwrap();

        let err = manager.run(root()).await.unwrap_err();
        assert_eq!(err, TaskError::execution("no database"));
        assert_eq!(task.state(), TaskState::Pending, "batch never started");
    }

    #[tokio::test]
    async fn shutdown_hook_runs_after_the_batch() {
        let ran = Arc::new(AtomicBool::new(false));
        let seen = ran.clone();
        let manager = TaskManager::new(1).unwrap().with_shutdown_hook(move || {
            let seen = seen.clone();
            async move {
                seen.store(true, Ordering::SeqCst);
                Ok(())
            }
        });
        let task = Task::new("job", (), |_ctx, _| async move { Ok(0u32) }).build();
        manager.add_task(task.clone()).unwrap();

        manager.run(root()).await.unwrap();

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[tokio::test]
    async fn hook_panic_surfaces_as_error() {
        let manager = TaskManager::new(1).unwrap().with_startup_hook(|| async {
            panic!("hook exploded");
            #[allow(unreachable_code)]
            Ok(())
        });
        let err = manager.run(root()).await.unwrap_err();
        assert_eq!(err, TaskError::Panic("hook exploded".to_string()));
    }

    #[tokio::test]
    async fn zero_concurrency_is_a_wiring_error() {
        assert!(matches!(
            TaskManager::new(0),
            Err(WiringError::InvalidConcurrency)
        ));
    }

    #[tokio::test]
    async fn empty_manager_runs_to_completion() {
        let manager = TaskManager::new(3).unwrap();
        assert!(manager.is_empty());
        manager.run(root()).await.unwrap();
        assert!(manager.execution_order().is_empty());
    }

    #[tokio::test]
    async fn graph_renders_roots_and_dependents() {
        let manager = TaskManager::new(1).unwrap();
        for name in ["a", "b", "c"] {
            manager
                .add_task(Task::new(name, (), |_ctx, _| async move { Ok(0u32) }).build())
                .unwrap();
        }
        manager.add_dependency("b", "a").unwrap();
        manager.add_dependency("c", "b").unwrap();

        let rendered = manager.graph();
        assert!(rendered.starts_with("a\n"));
        assert!(rendered.contains("└─> b"));
        assert!(rendered.contains("└─> c"));
        assert!(manager.contains("a"));
    }
}
