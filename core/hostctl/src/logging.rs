//! File logging for engine-hostctl.
//!
//! Logs go to `~/.engine-host/logs/hostctl.log` so stdout stays reserved for
//! command output. Logging is best-effort; a missing home directory just means
//! no log.

use std::env;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "hostctl.log";

/// Returns the writer guard; dropping it flushes pending lines.
pub fn init() -> Option<WorkerGuard> {
    let log_dir = dirs::home_dir()?.join(".engine-host").join("logs");
    fs_err::create_dir_all(&log_dir).ok()?;

    let appender = tracing_appender::rolling::never(&log_dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let debug_enabled = env::var("ENGINE_HOST_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}
