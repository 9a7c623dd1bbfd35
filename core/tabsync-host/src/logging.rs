//! File logging for the host.
//!
//! Stdout carries the native messaging protocol, so logs go to a daily file
//! under the data directory. `TABSYNC_DEBUG_LOG=1` forces debug level;
//! otherwise `RUST_LOG` applies, defaulting to info.

use std::env;
use std::path::Path;

use fs_err as fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "TABSYNC_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "tabsync-host.log";

fn debug_enabled() -> bool {
    env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn filter() -> EnvFilter {
    if debug_enabled() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Installs the global subscriber. The returned guard flushes buffered log
/// lines when dropped and must live until exit. Falls back to stderr when the
/// log directory cannot be created.
pub fn init(log_dir: &Path) -> Option<WorkerGuard> {
    if let Err(err) = fs::create_dir_all(log_dir) {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .init();
        tracing::warn!(error = %err, "Log directory unavailable; logging to stderr");
        return None;
    }

    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Some(guard)
}
