//! Bounded concurrency gate.
//!
//! Caps the number of in-flight spawned operations and optionally aggregates
//! the first error or panic any of them produced. The task manager sizes one
//! of these at its `max_concurrency` to bound simultaneously running workers.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::{Semaphore, watch};

use crate::error::{TaskError, panic_to_error};

/// Counting-semaphore gate over spawned operations.
///
/// [`spawn`](ConcurrencyGate::spawn) blocks the caller while `limit`
/// operations are in flight; [`wait`](ConcurrencyGate::wait) blocks until all
/// spawned operations have finished and reports the first recorded error.
/// All methods take `&self`; the gate is freely shareable across tasks.
pub struct ConcurrencyGate {
    sem: Option<Arc<Semaphore>>,
    in_flight: watch::Sender<usize>,
    first_err: Arc<Mutex<Option<TaskError>>>,
    capture_panics: bool,
}

impl ConcurrencyGate {
    /// Gate admitting at most `limit` concurrent operations; `0` means
    /// unlimited.
    pub fn new(limit: usize) -> Self {
        let (in_flight, _) = watch::channel(0usize);
        Self {
            sem: match limit {
                0 => None,
                n => Some(Arc::new(Semaphore::new(n))),
            },
            in_flight,
            first_err: Arc::new(Mutex::new(None)),
            capture_panics: false,
        }
    }

    /// Like [`new`](ConcurrencyGate::new), but each operation runs under a
    /// recovery wrapper: a panic becomes a [`TaskError::Panic`] routed to
    /// [`set_error`](ConcurrencyGate::set_error) instead of unwinding.
    pub fn with_panic_capture(limit: usize) -> Self {
        Self {
            capture_panics: true,
            ..Self::new(limit)
        }
    }

    /// Schedules `fut` on the runtime, waiting first for a free slot.
    ///
    /// An `Err` outcome (or a captured panic) is recorded through
    /// [`set_error`](ConcurrencyGate::set_error); it never aborts other
    /// operations.
    pub async fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let permit = match &self.sem {
            Some(sem) => match sem.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                // The semaphore is never closed; treat a closed one as unbounded.
                Err(_) => None,
            },
            None => None,
        };

        self.in_flight.send_modify(|n| *n += 1);

        let count = self.in_flight.clone();
        let first_err = self.first_err.clone();
        let capture = self.capture_panics;
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(fut).catch_unwind().await;
            // Accounting must run on every path, panicking included.
            drop(permit);
            count.send_modify(|n| *n -= 1);
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => record_first(&first_err, err),
                Err(payload) => {
                    if capture {
                        record_first(&first_err, panic_to_error(payload));
                    } else {
                        std::panic::resume_unwind(payload);
                    }
                }
            }
        });
    }

    /// Blocks until every spawned operation has completed, then returns the
    /// first recorded error, if any.
    pub async fn wait(&self) -> Result<(), TaskError> {
        let mut rx = self.in_flight.subscribe();
        loop {
            if *rx.borrow_and_update() == 0 {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        match &*self.first_err.lock().expect("gate error slot poisoned") {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Records `err` unless an error was already recorded. First writer wins;
    /// later errors are dropped.
    pub fn set_error(&self, err: TaskError) {
        record_first(&self.first_err, err);
    }

    /// Instantaneous count of outstanding operations.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }
}

fn record_first(slot: &Mutex<Option<TaskError>>, err: TaskError) {
    let mut guard = slot.lock().expect("gate error slot poisoned");
    if guard.is_none() {
        *guard = Some(err);
    }
}
