use std::path::{Path, PathBuf};

use tracing_appender::rolling;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILE: &str = "gradegrid.log";

/// Initialize the tracing/logging system.
///
/// Sets up a console layer (ANSI or JSON) and an optional daily-rolling file layer.
/// Calling it twice is harmless; the first subscriber stays installed.
pub fn init_logging(log_level: &str, log_file: Option<&Path>, structured: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let file_appender = log_file.map(|path| {
        let (dir, filename) = split_log_path(path);
        rolling::daily(dir, filename)
    });

    if structured {
        let console = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE);
        let file_layer = file_appender.map(|writer| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
        });

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console)
            .with(file_layer)
            .try_init();
    } else {
        let console = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_ansi(true);
        let file_layer = file_appender.map(|writer| {
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
        });

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console)
            .with(file_layer)
            .try_init();
    }
}

/// Split a log path into the rolling directory and file prefix.
pub fn split_log_path(path: &Path) -> (PathBuf, String) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| DEFAULT_LOG_FILE.to_string());
    (dir, filename)
}
