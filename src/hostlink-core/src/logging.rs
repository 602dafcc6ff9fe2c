//! Tracing setup for the supervisor and its binaries.
//!
//! Records go to a daily-rolled file in the log directory and, optionally, to stderr.
//! Stdout stays free for command output. Thread names are included because listener
//! delivery and plugin process readers run on named worker threads.

use crate::{config::LoggingConfig, paths::AppDirs};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{fmt, EnvFilter};

/// Overrides the configured level with a full filter directive when set.
pub const LOG_ENV_VAR: &str = "HOSTLINK_LOG";

const DEFAULT_LOG_FILE: &str = "hostlink.log";

/// Keeps the non-blocking file writer flushing until dropped.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

pub fn init_logging(config: &LoggingConfig, dirs: &AppDirs) -> Result<LoggingGuard, LoggingError> {
    let log_dir = dirs.log_dir();
    fs::create_dir_all(log_dir).map_err(|source| LoggingError::CreateDirectory {
        path: log_dir.to_path_buf(),
        source,
    })?;

    let filter = build_filter(config, std::env::var(LOG_ENV_VAR).ok())?;
    let file_stem = config.file_name.as_deref().unwrap_or(DEFAULT_LOG_FILE);
    let pruned = prune_rotated(log_dir, file_stem, config.max_log_files.max(1))?;

    let (file_writer, file_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, file_stem));
    let writer = if config.console {
        BoxMakeWriter::new(std::io::stderr.and(file_writer))
    } else {
        BoxMakeWriter::new(file_writer)
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(LoggingError::SubscriberInstall)?;

    tracing::debug!(dir = %log_dir.display(), pruned, "logging initialized");
    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

fn build_filter(config: &LoggingConfig, env_override: Option<String>) -> Result<EnvFilter, LoggingError> {
    let directive = env_override
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| config.level.to_string());
    EnvFilter::try_new(&directive).map_err(|source| LoggingError::ParseLevel {
        level: directive,
        source,
    })
}

/// Deletes the oldest rotated files named `<file_stem>*` until `keep` remain. Returns
/// how many were removed.
fn prune_rotated(dir: &Path, file_stem: &str, keep: usize) -> Result<usize, LoggingError> {
    let listing = fs::read_dir(dir).map_err(|source| LoggingError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut rotated: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in listing.flatten() {
        if !entry.file_name().to_string_lossy().starts_with(file_stem) {
            continue;
        }
        if let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) {
            rotated.push((modified, entry.path()));
        }
    }
    let excess = rotated.len().saturating_sub(keep);
    if excess == 0 {
        return Ok(0);
    }

    rotated.sort();
    for (_, path) in rotated.into_iter().take(excess) {
        fs::remove_file(&path).map_err(|source| LoggingError::Cleanup { path, source })?;
    }
    Ok(excess)
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter '{level}': {source}")]
    ParseLevel {
        level: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("failed to install tracing subscriber: {0}")]
    SubscriberInstall(Box<dyn std::error::Error + Send + Sync>),
    #[error("failed to list log directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove old log file {path}: {source}")]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },
}
