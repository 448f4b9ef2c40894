//! Background work for the Sidechain client
//!
//! Two services, both constructed explicitly and passed to whoever needs
//! them:
//! - [`TaskScheduler`]: a fixed pool of worker threads consuming one FIFO
//!   queue, returning a [`TaskHandle`] per scheduled closure that can be
//!   waited on or given a continuation
//! - [`Timers`]: delayed, debounced and throttled callbacks on a single
//!   timer thread
//!
//! ```rust,no_run
//! use sidechain_scheduler::TaskScheduler;
//! use std::time::Duration;
//!
//! let scheduler = TaskScheduler::with_default_threads()?;
//! let waveform = scheduler.schedule(|| vec![0.0f32; 512]);
//! assert!(scheduler.wait_for_all(Duration::from_secs(1)));
//! let peaks = waveform.wait()?;
//! # let _ = peaks;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod error;
pub mod handle;
pub mod pool;
pub mod timers;

pub use error::{Error, Result, TaskError};
pub use handle::{Completer, TaskHandle, TaskResult};
pub use pool::{TaskScheduler, TaskSchedulerBuilder, default_thread_count};
pub use timers::{TimerId, Timers};
