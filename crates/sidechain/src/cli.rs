use crate::tracing::{LogLevel, TracingFormat};
use clap::{Parser, Subcommand};
use miette::{Diagnostic, Report};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the CLI application
pub const EXIT_OK: i32 = 0;
/// Lookup found nothing
pub const EXIT_MISS: i32 = 1;
/// CLI or configuration error exit code
pub const EXIT_CLI: i32 = 2;
/// Cache or task failure exit code
pub const EXIT_RUNTIME: i32 = 3;

/// Environment variable for the cache size limit in bytes
pub const MAX_SIZE_ENV: &str = "SIDECHAIN_CACHE_MAX_BYTES";
/// Environment variable for the worker thread count
pub const THREADS_ENV: &str = "SIDECHAIN_THREADS";

/// CLI-specific error types with proper exit code mapping
#[derive(Error, Debug, Clone, Diagnostic)]
pub enum CliError {
    /// CLI or configuration error (exit code 2)
    #[error("Configuration error: {message}")]
    #[diagnostic(code(sidechain::cli::config))]
    Config {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// Cache or scheduler failure (exit code 3)
    #[error("{message}")]
    #[diagnostic(code(sidechain::cli::runtime))]
    Runtime {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
}

impl CliError {
    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    /// Create a new runtime error
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            help: None,
        }
    }

    /// Add help text to an existing error
    #[must_use]
    pub fn with_help(self, help_text: impl Into<String>) -> Self {
        let help = Some(help_text.into());
        match self {
            Self::Config { message, .. } => Self::Config { message, help },
            Self::Runtime { message, .. } => Self::Runtime { message, help },
        }
    }
}

impl From<sidechain_cache::Error> for CliError {
    fn from(err: sidechain_cache::Error) -> Self {
        let help = miette::Diagnostic::help(&err).map(|h| h.to_string());
        match err {
            sidechain_cache::Error::Configuration { message } => Self::Config { message, help },
            other => Self::Runtime {
                message: other.to_string(),
                help,
            },
        }
    }
}

impl From<sidechain_scheduler::Error> for CliError {
    fn from(err: sidechain_scheduler::Error) -> Self {
        match err {
            sidechain_scheduler::Error::Configuration { message } => Self::config(message),
            other => Self::runtime(other.to_string()),
        }
    }
}

/// Map CLI error to appropriate exit code
#[must_use]
pub const fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::Config { .. } => EXIT_CLI,
        CliError::Runtime { .. } => EXIT_RUNTIME,
    }
}

/// Error response envelope for JSON output
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope<E> {
    /// Always "error"
    pub status: &'static str,
    /// The error details
    pub error: E,
}

impl<E> ErrorEnvelope<E> {
    /// Create a new error envelope
    #[must_use]
    pub const fn new(error: E) -> Self {
        Self {
            status: "error",
            error,
        }
    }
}

/// Render an error to stderr, as a miette report or a JSON envelope
#[allow(clippy::print_stderr)]
pub fn render_error(err: &CliError, json_mode: bool) {
    if json_mode {
        let envelope = ErrorEnvelope::new(serde_json::json!({
            "code": match err {
                CliError::Config { .. } => "config",
                CliError::Runtime { .. } => "runtime",
            },
            "message": err.to_string(),
        }));
        match serde_json::to_string(&envelope) {
            Ok(json) => eprintln!("{json}"),
            Err(_) => eprintln!("Error serializing error response"),
        }
    } else {
        let report = Report::new(err.clone());
        eprintln!("{report:?}");
        let _ = io::stderr().flush();
    }
}

/// One `key=file` pair for the warm command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmItem {
    /// Cache key
    pub key: String,
    /// File to copy into the cache
    pub path: PathBuf,
}

fn parse_warm_item(raw: &str) -> Result<WarmItem, String> {
    let (key, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=FILE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    if path.is_empty() {
        return Err(format!("empty file path in '{raw}'"));
    }
    Ok(WarmItem {
        key: key.to_string(),
        path: PathBuf::from(path),
    })
}

/// Local file cache and background task runner for Sidechain
#[derive(Parser, Debug)]
#[command(name = "sidechain")]
#[command(about = "Manage the Sidechain local file cache")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Logging verbosity level.
    #[arg(
        short = 'L',
        long,
        global = true,
        help = "Set logging level",
        default_value = "warn",
        value_enum
    )]
    pub level: LogLevel,

    /// Emit JSON output and JSON logs.
    #[arg(long, global = true, help = "Emit JSON output and JSON logs")]
    pub json: bool,

    /// Log line format, overriding the one implied by --json.
    #[arg(long, global = true, value_enum, help = "Log output format")]
    pub log_format: Option<TracingFormat>,

    /// Cache directory override.
    #[arg(
        long,
        global = true,
        env = sidechain_cache::config::CACHE_DIR_ENV,
        value_name = "DIR",
        help = "Cache directory (defaults to the platform cache dir)"
    )]
    pub cache_dir: Option<PathBuf>,

    /// Cache size limit.
    #[arg(
        long,
        global = true,
        env = MAX_SIZE_ENV,
        value_name = "BYTES",
        help = "Maximum cache size in bytes"
    )]
    pub max_size: Option<u64>,

    /// Worker thread count.
    #[arg(
        long,
        global = true,
        env = THREADS_ENV,
        value_name = "N",
        help = "Number of worker threads for parallel commands"
    )]
    pub threads: Option<usize>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Print the cached path for a key, exiting 1 on a miss.
    Get {
        /// Cache key
        key: String,
    },
    /// Copy a file into the cache under a key.
    Put {
        /// Cache key
        key: String,
        /// File to cache
        file: PathBuf,
    },
    /// Remove a key and its cached file.
    Remove {
        /// Cache key
        key: String,
    },
    /// Remove every cached file.
    Clear,
    /// Show cache statistics.
    Stats,
    /// Cache many files in parallel.
    Warm {
        /// Pairs of KEY=FILE
        #[arg(required = true, value_name = "KEY=FILE", value_parser = parse_warm_item)]
        items: Vec<WarmItem>,
    },
}

impl Commands {
    /// Name used in logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "get",
            Self::Put { .. } => "put",
            Self::Remove { .. } => "remove",
            Self::Clear => "clear",
            Self::Stats => "stats",
            Self::Warm { .. } => "warm",
        }
    }
}

/// Parse command line arguments into a CLI structure.
#[must_use]
pub fn parse() -> Cli {
    Cli::parse()
}
