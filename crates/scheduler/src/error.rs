//! Error types for the scheduler crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Errors raised while setting up schedulers and timers
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Invalid scheduler configuration
    #[error("Scheduler configuration error: {message}")]
    #[diagnostic(code(sidechain::scheduler::config))]
    Configuration {
        /// Error message describing the configuration problem
        message: String,
    },

    /// The operating system refused to start a thread
    #[error("Failed to spawn thread {name}")]
    #[diagnostic(
        code(sidechain::scheduler::spawn),
        help("The process may have hit its thread limit")
    )]
    Spawn {
        /// Name of the thread that failed to start
        name: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a thread spawn error
    #[must_use]
    pub fn spawn(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            name: name.into(),
            source,
        }
    }
}

/// Result type for scheduler setup
pub type Result<T> = std::result::Result<T, Error>;

/// Why a scheduled task produced no value
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task panicked; the worker survived and moved on
    #[error("Task panicked: {message}")]
    #[diagnostic(code(sidechain::scheduler::task_panicked))]
    Panicked {
        /// Panic payload rendered as text
        message: String,
    },

    /// The task was dropped before it ran
    #[error("Task was cancelled before it ran")]
    #[diagnostic(code(sidechain::scheduler::task_cancelled))]
    Cancelled,

    /// The scheduler had already shut down when the task was submitted
    #[error("Scheduler is shut down")]
    #[diagnostic(code(sidechain::scheduler::shut_down))]
    ShutDown,
}

impl TaskError {
    /// Create a panic error
    #[must_use]
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::Panicked {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error() {
        let err = Error::configuration("thread count must be non-zero");
        assert!(err.to_string().contains("Scheduler configuration error"));
        assert!(err.to_string().contains("non-zero"));
    }

    #[test]
    fn test_spawn_error() {
        let err = Error::spawn("sidechain-worker-3", std::io::Error::other("limit"));
        assert!(err.to_string().contains("sidechain-worker-3"));
    }

    #[test]
    fn test_task_error_messages() {
        assert_eq!(
            TaskError::panicked("index out of bounds").to_string(),
            "Task panicked: index out of bounds"
        );
        assert!(TaskError::Cancelled.to_string().contains("cancelled"));
        assert!(TaskError::ShutDown.to_string().contains("shut down"));
    }

    #[test]
    fn test_errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
        assert_send_sync::<TaskError>();
    }
}
