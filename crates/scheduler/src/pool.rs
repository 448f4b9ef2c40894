//! Fixed-size worker pool
//!
//! A small set of named OS threads pulls boxed tasks from one shared FIFO
//! queue. Idle workers sleep on a condition variable; `schedule` never blocks
//! on the work itself. A panicking task is caught and recorded in its
//! [`TaskHandle`], and the worker moves on to the next task.

use crate::error::{Error, Result, TaskError};
use crate::handle::{self, TaskHandle};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Upper bound on the default worker count
pub const MAX_DEFAULT_THREADS: usize = 8;

/// How often `wait_for_all` re-checks the queue
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Default worker thread name prefix
const DEFAULT_THREAD_PREFIX: &str = "sidechain-worker";

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

/// State shared between the scheduler and its workers
struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    active: AtomicUsize,
}

/// Worker count used when none is configured: hardware concurrency, capped
#[must_use]
pub fn default_thread_count() -> usize {
    thread::available_parallelism()
        .map_or(1, NonZeroUsize::get)
        .min(MAX_DEFAULT_THREADS)
}

/// Builder for [`TaskScheduler`]
#[derive(Debug, Clone)]
pub struct TaskSchedulerBuilder {
    threads: Option<usize>,
    thread_prefix: String,
}

impl Default for TaskSchedulerBuilder {
    fn default() -> Self {
        Self {
            threads: None,
            thread_prefix: DEFAULT_THREAD_PREFIX.to_string(),
        }
    }
}

impl TaskSchedulerBuilder {
    /// Creates a new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Set the prefix used to name worker threads
    #[must_use]
    pub fn thread_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_prefix = prefix.into();
        self
    }

    /// Spawn the workers
    ///
    /// # Errors
    ///
    /// Returns an error if the thread count is zero or a thread fails to
    /// start
    pub fn build(self) -> Result<TaskScheduler> {
        let threads = self.threads.unwrap_or_else(default_thread_count);
        if threads == 0 {
            return Err(Error::configuration("Thread count must be non-zero"));
        }

        let scheduler = TaskScheduler {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    jobs: VecDeque::new(),
                    shutdown: false,
                }),
                available: Condvar::new(),
                active: AtomicUsize::new(0),
            }),
            workers: Mutex::new(Vec::with_capacity(threads)),
            thread_count: threads,
            shut_down: AtomicBool::new(false),
        };

        for worker_id in 0..threads {
            let name = format!("{}-{worker_id}", self.thread_prefix);
            let shared = Arc::clone(&scheduler.shared);
            // On failure the partially built scheduler is dropped, which
            // joins the workers already started
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(worker_id, &shared))
                .map_err(|e| Error::spawn(name, e))?;
            scheduler.workers.lock().push(handle);
        }

        info!(threads, "Task scheduler started");
        Ok(scheduler)
    }
}

/// Bounded pool of worker threads executing scheduled closures
pub struct TaskScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    thread_count: usize,
    shut_down: AtomicBool,
}

impl TaskScheduler {
    /// Start a scheduler with exactly `threads` workers
    ///
    /// # Errors
    ///
    /// Returns an error if `threads` is zero or a thread fails to start
    pub fn new(threads: usize) -> Result<Self> {
        TaskSchedulerBuilder::new().threads(threads).build()
    }

    /// Start a scheduler sized to the machine (at most eight workers)
    ///
    /// # Errors
    ///
    /// Returns an error if a thread fails to start
    pub fn with_default_threads() -> Result<Self> {
        TaskSchedulerBuilder::new().build()
    }

    /// Start a builder
    #[must_use]
    pub fn builder() -> TaskSchedulerBuilder {
        TaskSchedulerBuilder::new()
    }

    /// Queue `work` and return a handle to its result
    ///
    /// Returns immediately. If the scheduler has shut down, the returned
    /// handle is already resolved with [`TaskError::ShutDown`].
    pub fn schedule<F, T>(&self, work: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (completer, handle) = handle::channel();
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(work))
                .map_err(|payload| TaskError::panicked(panic_message(payload.as_ref())));
            if let Err(e) = &outcome {
                error!(error = %e, "Scheduled task failed");
            }
            completer.complete(outcome);
        });

        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                drop(queue);
                drop(job);
                debug!("Rejected task submitted after shutdown");
                return TaskHandle::resolved(Err(TaskError::ShutDown));
            }
            queue.jobs.push_back(job);
            trace!(pending = queue.jobs.len(), "Task queued");
        }
        self.shared.available.notify_one();
        handle
    }

    /// Wait until the queue is drained and no task is running
    ///
    /// Polls rather than blocking on a condition variable. Returns `false`
    /// if `timeout` elapses first. A timeout too large to represent as a
    /// deadline waits without bound.
    pub fn wait_for_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.is_idle() {
                return true;
            }
            let nap = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    IDLE_POLL_INTERVAL.min(deadline - now)
                }
                None => IDLE_POLL_INTERVAL,
            };
            thread::sleep(nap);
        }
    }

    /// Stop the workers and wait for them to exit
    ///
    /// Tasks already running finish; tasks still queued are dropped and
    /// their handles resolve with [`TaskError::Cancelled`]. Calling this more
    /// than once is a no-op.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let abandoned: Vec<Job> = {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            queue.jobs.drain(..).collect()
        };
        self.shared.available.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                // Shutdown requested from inside a task; this worker exits on
                // its own once the task returns
                continue;
            }
            if worker.join().is_err() {
                warn!("Worker thread exited abnormally");
            }
        }

        if !abandoned.is_empty() {
            debug!(cancelled = abandoned.len(), "Dropping tasks queued at shutdown");
        }
        drop(abandoned);
        info!("Task scheduler stopped");
    }

    /// Number of worker threads
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Tasks waiting for a worker
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    /// Tasks currently executing
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Whether [`TaskScheduler::shutdown`] has been called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn is_idle(&self) -> bool {
        // Workers bump `active` while holding the queue lock, so there is no
        // window where a task is neither queued nor counted
        let queue = self.shared.queue.lock();
        queue.jobs.is_empty() && self.shared.active.load(Ordering::SeqCst) == 0
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("thread_count", &self.thread_count)
            .field("pending", &self.pending_count())
            .field("active", &self.active_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Worker thread main loop
fn worker_loop(worker_id: usize, shared: &Shared) {
    debug!(worker_id, "Worker started");

    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.shutdown {
                    debug!(worker_id, "Worker stopping");
                    return;
                }
                if let Some(job) = queue.jobs.pop_front() {
                    shared.active.fetch_add(1, Ordering::SeqCst);
                    break job;
                }
                shared.available.wait(&mut queue);
            }
        };

        // Run outside the lock; panics are caught inside the job
        job();
        shared.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Render a panic payload as text
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked with a non-string payload".to_string()
    }
}
