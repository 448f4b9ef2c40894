//! One-shot promise/future pair connecting a queued task to its caller
//!
//! A [`TaskHandle`] is consumed either by blocking ([`TaskHandle::wait`],
//! [`TaskHandle::wait_timeout`]) or by registering a continuation with
//! [`TaskHandle::on_complete`].

use crate::error::TaskError;
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::error;

/// What a task resolves to
pub type TaskResult<T> = std::result::Result<T, TaskError>;

type Continuation<T> = Box<dyn FnOnce(TaskResult<T>) + Send + 'static>;

struct Cell<T> {
    outcome: Option<TaskResult<T>>,
    continuation: Option<Continuation<T>>,
}

struct Slot<T> {
    cell: Mutex<Cell<T>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn resolve(&self, outcome: TaskResult<T>) {
        let mut cell = self.cell.lock();
        if let Some(continuation) = cell.continuation.take() {
            drop(cell);
            run_continuation(continuation, outcome);
            return;
        }
        cell.outcome = Some(outcome);
        drop(cell);
        self.ready.notify_all();
    }
}

fn run_continuation<T>(continuation: Continuation<T>, outcome: TaskResult<T>) {
    if panic::catch_unwind(AssertUnwindSafe(move || continuation(outcome))).is_err() {
        error!("Task continuation panicked");
    }
}

/// Create a connected completer/handle pair
#[must_use]
pub fn channel<T>() -> (Completer<T>, TaskHandle<T>) {
    let slot = Arc::new(Slot {
        cell: Mutex::new(Cell {
            outcome: None,
            continuation: None,
        }),
        ready: Condvar::new(),
    });
    (
        Completer {
            slot: Some(Arc::clone(&slot)),
        },
        TaskHandle { slot },
    )
}

/// Write side of a task's result
///
/// Dropping a completer without calling [`Completer::complete`] resolves the
/// handle with [`TaskError::Cancelled`], so a waiter is never stranded.
pub struct Completer<T> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T> Completer<T> {
    /// Publish the task's outcome and wake the waiter
    pub fn complete(mut self, outcome: TaskResult<T>) {
        if let Some(slot) = self.slot.take() {
            slot.resolve(outcome);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.resolve(Err(TaskError::Cancelled));
        }
    }
}

impl<T> std::fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer")
            .field("pending", &self.slot.is_some())
            .finish()
    }
}

/// Read side of a task's result
pub struct TaskHandle<T> {
    slot: Arc<Slot<T>>,
}

impl<T> TaskHandle<T> {
    /// A handle that is already resolved
    #[must_use]
    pub fn resolved(outcome: TaskResult<T>) -> Self {
        let (completer, handle) = channel();
        completer.complete(outcome);
        handle
    }

    /// Whether the task has finished (successfully or not)
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.slot.cell.lock().outcome.is_some()
    }

    /// Run `continuation` with the outcome once the task finishes
    ///
    /// Never blocks. If the task has already finished, the continuation runs
    /// right away on the calling thread; otherwise it runs on the thread that
    /// resolves the task (a worker, or whichever thread drops a queued task at
    /// shutdown). A panicking continuation is logged and swallowed.
    pub fn on_complete<F>(self, continuation: F)
    where
        F: FnOnce(TaskResult<T>) + Send + 'static,
    {
        let mut cell = self.slot.cell.lock();
        if let Some(outcome) = cell.outcome.take() {
            drop(cell);
            run_continuation(Box::new(continuation), outcome);
        } else {
            cell.continuation = Some(Box::new(continuation));
        }
    }

    /// Block until the task finishes and return its outcome
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Panicked`] if the task panicked, or
    /// [`TaskError::Cancelled`] / [`TaskError::ShutDown`] if it never ran
    pub fn wait(self) -> TaskResult<T> {
        let mut cell = self.slot.cell.lock();
        loop {
            if let Some(outcome) = cell.outcome.take() {
                return outcome;
            }
            self.slot.ready.wait(&mut cell);
        }
    }

    /// Block for at most `timeout`
    ///
    /// Returns the outcome if the task finished in time, or hands the handle
    /// back so the caller can keep waiting later.
    ///
    /// # Errors
    ///
    /// Returns `Err(self)` if the task has not finished when the timeout
    /// elapses
    pub fn wait_timeout(self, timeout: Duration) -> Result<TaskResult<T>, Self> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Ok(self.wait());
        };
        {
            let mut cell = self.slot.cell.lock();
            loop {
                if let Some(outcome) = cell.outcome.take() {
                    return Ok(outcome);
                }
                if self.slot.ready.wait_until(&mut cell, deadline).timed_out() {
                    if let Some(outcome) = cell.outcome.take() {
                        return Ok(outcome);
                    }
                    break;
                }
            }
        }
        Err(self)
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}
