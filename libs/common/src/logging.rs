//! Logging setup for gateway binaries.
//!
//! Each binary calls [`init`] once at startup. The `logs` option selects the
//! sink: the literal string `stdout` logs to the console, anything else is
//! treated as a file path handed to `tracing-appender`.

use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};

// Keeps the non-blocking writer alive for the process lifetime
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the global tracing subscriber.
///
/// `target` is either `"stdout"` or a log-file path. The filter defaults to
/// `info` and honors `RUST_LOG` overrides.
pub fn init(target: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if target == "stdout" {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
            .map_err(|e| Error::Config(format!("logging init failed: {e}")))?;
        return Ok(());
    }

    let path = Path::new(target);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file = path
        .file_name()
        .ok_or_else(|| Error::Config(format!("bad log path: {target}")))?;

    let appender = tracing_appender::rolling::never(dir, file);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = GUARD.set(guard);

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(|e| Error::Config(format!("logging init failed: {e}")))?;
    Ok(())
}
