//! sidechain CLI
//!
//! Builds the file cache and the task scheduler once and hands them to the
//! selected command.

mod cli;
mod commands;
mod tracing;

use crate::cli::{Cli, CliError, exit_code_for, render_error};
use crate::commands::Context;
use crate::tracing::{TracingConfig, TracingFormat};
use sidechain_cache::{FileCache, FileCacheConfig};
use sidechain_scheduler::TaskScheduler;
use std::sync::Arc;

fn main() {
    // Tracing may not be usable while panicking
    #[allow(clippy::print_stderr)]
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panicked: {panic_info}");
        eprintln!("Internal error occurred. Run with RUST_LOG=debug for more information.");
    }));

    let cli = cli::parse();
    let json = cli.json;
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            render_error(&err, json);
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn build_context(cli: &Cli) -> Result<Context, CliError> {
    let mut builder = FileCacheConfig::builder();
    if let Some(dir) = &cli.cache_dir {
        builder = builder.directory(dir);
    }
    if let Some(max) = cli.max_size {
        builder = builder.max_size_bytes(max);
    }
    let config = builder.build()?;
    let cache = FileCache::open(config)?;

    let scheduler = match cli.threads {
        Some(threads) => TaskScheduler::new(threads)
            .map_err(|e| CliError::from(e).with_help("Pass --threads 1 or more"))?,
        None => TaskScheduler::with_default_threads()?,
    };

    Ok(Context {
        cache: Arc::new(cache),
        scheduler,
        json: cli.json,
    })
}

fn run(cli: Cli) -> Result<i32, CliError> {
    let format = cli.log_format.unwrap_or(if cli.json {
        TracingFormat::Json
    } else {
        TracingFormat::Compact
    });
    crate::tracing::init_tracing(TracingConfig {
        format,
        level: cli.level.into(),
    })
    .map_err(|e| CliError::config(e.to_string()))?;

    let _span = ::tracing::info_span!(
        "command",
        command = cli.command.name(),
        correlation_id = %crate::tracing::correlation_id(),
    )
    .entered();

    let ctx = build_context(&cli)?;
    let mut stdout = std::io::stdout().lock();
    let code = commands::execute(&ctx, cli.command, &mut stdout)?;
    ctx.scheduler.shutdown();
    Ok(code)
}
