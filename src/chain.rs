//! Ordered batch runner for caller-supplied functions.
//!
//! A [`FuncChain`] collects [`FuncItem`]s and executes them one by one in
//! ascending priority order (stable for ties). Each item runs under a
//! recovery wrapper; panics and errors are stored on the item itself, so
//! [`FuncChain::execute`] never fails as a whole. The task manager routes
//! its lifecycle hooks through a chain to give them the same panic capture
//! as every other caller-supplied callable.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::{TaskError, panic_to_error};

type FuncFactory<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T, TaskError>> + Send + Sync>;

/// One batch entry: a priority, a future factory and per-run outcome cells.
pub struct FuncItem<T> {
    priority: i32,
    func: FuncFactory<T>,
    result: Option<T>,
    error: Option<TaskError>,
}

impl<T> FuncItem<T> {
    /// Wraps `f` so that each execution produces a fresh future.
    pub fn new<F, Fut>(priority: i32, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        Self {
            priority,
            func: Box::new(move || f().boxed()),
            result: None,
            error: None,
        }
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Result of the most recent execution, if it succeeded.
    pub fn result(&self) -> Option<&T> {
        self.result.as_ref()
    }

    /// Error of the most recent execution; panics appear as
    /// [`TaskError::Panic`].
    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }
}

/// Ordered batch of [`FuncItem`]s.
pub struct FuncChain<T> {
    items: Vec<FuncItem<T>>,
}

impl<T> FuncChain<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn add_func_item(&mut self, item: FuncItem<T>) {
        self.items.push(item);
    }

    /// Runs every item in ascending priority order.
    ///
    /// The sort is stable, so two executions over identical items produce
    /// identical orderings. Outcome cells are reset first; re-executing
    /// without [`clear`](FuncChain::clear) re-runs each item with fresh
    /// result/error cells.
    pub async fn execute(&mut self) {
        self.items.sort_by_key(|item| item.priority);
        for item in &mut self.items {
            item.result = None;
            item.error = None;
            match AssertUnwindSafe((item.func)()).catch_unwind().await {
                Ok(Ok(value)) => item.result = Some(value),
                Ok(Err(err)) => item.error = Some(err),
                Err(payload) => item.error = Some(panic_to_error(payload)),
            }
        }
    }

    /// The batch in post-execution order.
    pub fn func_items(&self) -> &[FuncItem<T>] {
        &self.items
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Default for FuncChain<T> {
    fn default() -> Self {
        Self::new()
    }
}
