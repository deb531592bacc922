use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, filter::LevelFilter, fmt, prelude::*};

/// Where human-facing log lines go in addition to the event log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Console {
    /// Server mode: every event is mirrored to stdout.
    Stdout,
    /// Client mode: stdout belongs to the chat, so only warnings reach stderr.
    Stderr,
}

/// Installs the global subscriber: an env-filtered console layer plus an
/// append-only file layer at `log_file`. Keep the guard alive until exit so
/// buffered events reach the file.
pub fn init(console: Console, log_file: &Path) -> Result<WorkerGuard> {
    let (dir, file_name) = split_log_path(log_file)?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(file_writer);

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    let installed = match console {
        Console::Stdout => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stdout))
            .try_init(),
        Console::Stderr => registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_filter(LevelFilter::WARN),
            )
            .try_init(),
    };
    installed.map_err(|err| anyhow::anyhow!("failed to initialize logging: {err}"))?;

    Ok(guard)
}

fn split_log_path(log_file: &Path) -> Result<(&Path, &std::ffi::OsStr)> {
    let file_name = log_file
        .file_name()
        .with_context(|| format!("log path {} has no file name", log_file.display()))?;
    let dir = match log_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok((dir, file_name))
}
