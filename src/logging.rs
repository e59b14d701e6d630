//! Process-wide logging setup.
//!
//! Configured once at startup from the CLI entrypoint and injected downward
//! (every stage logs through the global `tracing` dispatcher rather than a
//! module-level singleton the orchestrator has no control over).

use std::path::Path;

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Holds the non-blocking file writer's worker thread alive for as long as
/// logging should keep flushing to `log_path`. Drop it only at process exit.
pub struct LoggingGuard {
    _file_guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Installs a console layer (compact, `RUST_LOG`-filtered, defaulting to
/// `info`) plus a file layer writing to `log_path`.
pub fn init(log_path: &Path) -> Result<LoggingGuard> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(file);

    let console_layer = tracing_subscriber::fmt::layer().with_target(false).compact();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(file_writer);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
