//! Structured logging setup using `tracing-subscriber` and `tracing-appender`.
//!
//! Three modes:
//! - **Function runtime** ([`init_json`]): JSON lines on stdout, picked up by the log pipeline
//! - **CLI** ([`init_cli`]): human-readable console output on stderr
//! - **File** ([`init_with_file`]): JSON file layer (daily rotation) + console layer

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "cosign-gate.log";

/// Holds the non-blocking writer guard for file logging.
///
/// Dropping it flushes pending log entries and closes the file.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialise JSON logging to stdout for the function runtime.
///
/// Filtered by `RUST_LOG` (default: `info`). Span fields (invocation id,
/// task ARN) are flattened onto every event.
pub fn init_json() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter())
        .with_current_span(true)
        .with_span_list(false)
        .with_target(false)
        .without_time()
        .init();
}

/// Initialise console logging for one-shot subcommands.
///
/// Emits human-readable output to stderr only, so stdout stays free for
/// the JSON report.
pub fn init_cli() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}

/// Initialise console logging plus a JSON log file rotated daily.
///
/// Writes to `{logs_dir}/cosign-gate.log.YYYY-MM-DD`. Returns a
/// [`LoggingGuard`] that must be kept alive for log flushing.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created.
pub fn init_with_file(logs_dir: &Path) -> std::io::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(json_layer)
        .with(console_layer)
        .init();

    Ok(LoggingGuard { _guard: guard })
}
