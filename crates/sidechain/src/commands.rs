//! Command implementations
//!
//! Commands receive the cache and scheduler built in `main` and write their
//! results to the given writer. They return the process exit code.

use crate::cli::{CliError, Commands, EXIT_MISS, EXIT_OK, EXIT_RUNTIME, WarmItem};
use serde::Serialize;
use sidechain_cache::{CacheStats, FileCache};
use sidechain_scheduler::{TaskResult, TaskScheduler};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use tracing::{debug, info, warn};

/// Services shared by every command
#[derive(Debug)]
pub struct Context {
    pub cache: Arc<FileCache>,
    pub scheduler: TaskScheduler,
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct KeyPath<'a> {
    key: &'a str,
    path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct WarmOutcome {
    key: String,
    path: Option<PathBuf>,
    error: Option<String>,
}

fn write_err(e: std::io::Error) -> CliError {
    CliError::runtime(format!("Failed to write output: {e}"))
}

fn emit_json<T: Serialize>(out: &mut impl Write, value: &T) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| CliError::runtime(format!("Failed to serialize output: {e}")))?;
    writeln!(out, "{json}").map_err(write_err)
}

/// Run `command` against `ctx`
///
/// # Errors
///
/// Returns an error if the command cannot complete or output cannot be written
pub fn execute(ctx: &Context, command: Commands, out: &mut impl Write) -> Result<i32, CliError> {
    debug!(command = command.name(), "Executing command");
    match command {
        Commands::Get { key } => get(ctx, &key, out),
        Commands::Put { key, file } => put(ctx, &key, &file, out),
        Commands::Remove { key } => remove(ctx, &key, out),
        Commands::Clear => clear(ctx, out),
        Commands::Stats => stats(ctx, out),
        Commands::Warm { items } => warm(ctx, items, out),
    }
}

fn get(ctx: &Context, key: &str, out: &mut impl Write) -> Result<i32, CliError> {
    let path = ctx.cache.get_file(key);
    let code = if path.is_some() { EXIT_OK } else { EXIT_MISS };

    if ctx.json {
        emit_json(out, &KeyPath { key, path })?;
    } else if let Some(path) = path {
        writeln!(out, "{}", path.display()).map_err(write_err)?;
    }
    Ok(code)
}

fn put(ctx: &Context, key: &str, file: &Path, out: &mut impl Write) -> Result<i32, CliError> {
    let path = ctx.cache.try_cache_file(key, file)?;
    info!(key, source = %file.display(), "Cached file");

    if ctx.json {
        emit_json(
            out,
            &KeyPath {
                key,
                path: Some(path),
            },
        )?;
    } else {
        writeln!(out, "{}", path.display()).map_err(write_err)?;
    }
    Ok(EXIT_OK)
}

fn remove(ctx: &Context, key: &str, out: &mut impl Write) -> Result<i32, CliError> {
    let existed = ctx.cache.contains(key);
    ctx.cache.remove_file(key);

    if ctx.json {
        emit_json(out, &serde_json::json!({ "key": key, "removed": existed }))?;
    } else if existed {
        writeln!(out, "Removed {key}").map_err(write_err)?;
    } else {
        writeln!(out, "Not cached: {key}").map_err(write_err)?;
    }
    Ok(EXIT_OK)
}

fn clear(ctx: &Context, out: &mut impl Write) -> Result<i32, CliError> {
    let entries = ctx.cache.len();
    ctx.cache.clear();

    if ctx.json {
        emit_json(out, &serde_json::json!({ "cleared": entries }))?;
    } else {
        writeln!(out, "Cleared {entries} cached files").map_err(write_err)?;
    }
    Ok(EXIT_OK)
}

fn render_stats(
    stats: &CacheStats,
    directory: &Path,
    out: &mut impl Write,
) -> std::io::Result<()> {
    writeln!(out, "Directory:  {}", directory.display())?;
    writeln!(out, "Entries:    {}", stats.entries)?;
    writeln!(out, "Size:       {} / {} bytes", stats.total_bytes, stats.max_bytes)?;
    writeln!(out, "Hits:       {}", stats.hits)?;
    writeln!(out, "Misses:     {}", stats.misses)?;
    writeln!(out, "Evictions:  {}", stats.evictions)?;
    writeln!(out, "Hit rate:   {:.1}%", stats.hit_rate * 100.0)
}

fn stats(ctx: &Context, out: &mut impl Write) -> Result<i32, CliError> {
    let stats = ctx.cache.stats();
    if ctx.json {
        emit_json(
            out,
            &serde_json::json!({
                "directory": ctx.cache.directory(),
                "stats": stats,
            }),
        )?;
    } else {
        render_stats(&stats, ctx.cache.directory(), out).map_err(write_err)?;
    }
    Ok(EXIT_OK)
}

fn warm_outcome(
    key: String,
    outcome: TaskResult<sidechain_cache::Result<PathBuf>>,
) -> WarmOutcome {
    match outcome {
        Ok(Ok(path)) => {
            debug!(key = %key, "Warmed cache entry");
            WarmOutcome {
                key,
                path: Some(path),
                error: None,
            }
        }
        Ok(Err(e)) => {
            warn!(key = %key, error = %e, "Failed to warm cache entry");
            WarmOutcome {
                key,
                path: None,
                error: Some(e.to_string()),
            }
        }
        Err(e) => WarmOutcome {
            key,
            path: None,
            error: Some(e.to_string()),
        },
    }
}

fn warm(ctx: &Context, items: Vec<WarmItem>, out: &mut impl Write) -> Result<i32, CliError> {
    let total = items.len();
    let (tx, rx) = mpsc::channel();
    for (index, item) in items.into_iter().enumerate() {
        let cache = Arc::clone(&ctx.cache);
        let tx = tx.clone();
        let key = item.key.clone();
        ctx.scheduler
            .schedule(move || cache.try_cache_file(&item.key, &item.path))
            .on_complete(move |outcome| {
                // The receiver drains until every sender is gone
                let _ = tx.send((index, warm_outcome(key, outcome)));
            });
    }
    drop(tx);

    let mut finished: Vec<(usize, WarmOutcome)> = rx.iter().collect();
    finished.sort_by_key(|(index, _)| *index);
    let outcomes: Vec<WarmOutcome> = finished.into_iter().map(|(_, outcome)| outcome).collect();

    let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
    info!(total, failed, "Warm finished");

    if ctx.json {
        emit_json(out, &outcomes)?;
    } else {
        for outcome in &outcomes {
            match (&outcome.path, &outcome.error) {
                (Some(path), _) => writeln!(out, "{}\t{}", outcome.key, path.display()),
                (None, Some(error)) => writeln!(out, "{}\tfailed: {error}", outcome.key),
                (None, None) => Ok(()),
            }
            .map_err(write_err)?;
        }
    }

    Ok(if failed == 0 { EXIT_OK } else { EXIT_RUNTIME })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use sidechain_cache::FileCacheConfig;
    use tempfile::TempDir;

    fn context(dir: &TempDir, json: bool) -> Context {
        let config = FileCacheConfig::new(dir.path().join("cache"));
        Context {
            cache: Arc::new(FileCache::open(config).unwrap()),
            scheduler: TaskScheduler::new(2).unwrap(),
            json,
        }
    }

    fn run(ctx: &Context, command: Commands) -> (i32, String) {
        let mut out = Vec::new();
        let code = execute(ctx, command, &mut out).unwrap();
        (code, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_get_miss_exits_one() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, false);

        let (code, output) = run(&ctx, Commands::Get { key: "nope".into() });
        assert_eq!(code, EXIT_MISS);
        assert!(output.is_empty());
    }

    #[test]
    fn test_put_then_get_prints_path() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, false);
        let source = dir.path().join("kick.wav");
        std::fs::write(&source, b"RIFF").unwrap();

        let (code, put_out) = run(
            &ctx,
            Commands::Put {
                key: "kick".into(),
                file: source,
            },
        );
        assert_eq!(code, EXIT_OK);

        let (code, get_out) = run(&ctx, Commands::Get { key: "kick".into() });
        assert_eq!(code, EXIT_OK);
        assert_eq!(put_out, get_out);
        assert_eq!(std::fs::read(get_out.trim()).unwrap(), b"RIFF");
    }

    #[test]
    fn test_put_missing_source_is_error() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, false);

        let mut out = Vec::new();
        let result = execute(
            &ctx,
            Commands::Put {
                key: "ghost".into(),
                file: dir.path().join("missing.wav"),
            },
            &mut out,
        );
        assert!(matches!(result, Err(CliError::Runtime { .. })));
    }

    #[test]
    fn test_warm_caches_all_items_in_parallel() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, true);
        let items: Vec<WarmItem> = (0..6)
            .map(|i| {
                let path = dir.path().join(format!("{i}.wav"));
                std::fs::write(&path, vec![0u8; 16]).unwrap();
                WarmItem {
                    key: format!("sample-{i}"),
                    path,
                }
            })
            .collect();

        let (code, output) = run(&ctx, Commands::Warm { items });
        assert_eq!(code, EXIT_OK);
        assert_eq!(ctx.cache.len(), 6);

        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 6);
    }

    #[test]
    fn test_warm_reports_partial_failure() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, false);
        let good = dir.path().join("good.wav");
        std::fs::write(&good, b"data").unwrap();

        let items = vec![
            WarmItem {
                key: "good".into(),
                path: good,
            },
            WarmItem {
                key: "bad".into(),
                path: dir.path().join("absent.wav"),
            },
        ];

        let (code, output) = run(&ctx, Commands::Warm { items });
        assert_eq!(code, EXIT_RUNTIME);
        assert!(output.contains("bad\tfailed"));
        assert!(ctx.cache.contains("good"));
    }

    #[test]
    fn test_stats_json_and_text() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, true);
        ctx.cache.cache_bytes("a", b"12345").unwrap();
        let _ = ctx.cache.get_file("a");

        let (_, output) = run(&ctx, Commands::Stats);
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["stats"]["entries"], 1);
        assert_eq!(parsed["stats"]["total_bytes"], 5);
        assert_eq!(parsed["stats"]["hits"], 1);

        let text_ctx = Context { json: false, ..ctx };
        let (_, text) = run(&text_ctx, Commands::Stats);
        assert!(text.contains("Entries:    1"));
    }

    #[test]
    fn test_remove_and_clear() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, false);
        ctx.cache.cache_bytes("a", b"1").unwrap();
        ctx.cache.cache_bytes("b", b"2").unwrap();

        let (_, output) = run(&ctx, Commands::Remove { key: "a".into() });
        assert_eq!(output.trim(), "Removed a");
        let (_, output) = run(&ctx, Commands::Remove { key: "a".into() });
        assert_eq!(output.trim(), "Not cached: a");

        let (_, output) = run(&ctx, Commands::Clear);
        assert_eq!(output.trim(), "Cleared 1 cached files");
        assert!(ctx.cache.is_empty());
    }
}
