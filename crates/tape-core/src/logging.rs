//! Logging initialization using the `tracing` ecosystem.
//!
//! The collector runs unattended for hours, so logging is set up for two
//! audiences at once: a compact console stream for the operator, and an
//! optional daily-rotating file for post-run inspection. File writes go
//! through a non-blocking worker so a slow disk never stalls a market-data
//! callback path.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Keeps the non-blocking file writer flushing.
///
/// Hold this for the lifetime of the process; dropping it flushes and closes
/// the log file worker.
pub struct LogGuard {
    _file_worker: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Build the log filter: `RUST_LOG` wins, otherwise `log_level` for the
/// collector's own crates with the chattiest transport dependencies capped
/// at `warn` (handshake retries would otherwise drown the feed logs at
/// `debug`).
fn build_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{log_level},tungstenite=warn,tokio_tungstenite=warn,reqwest=warn,hyper=warn"
        ))
    })
}

/// Initialize the global tracing subscriber.
///
/// Should be called once at program start; the returned [`LogGuard`] must be
/// kept alive by the caller (file output stops flushing without it).
///
/// # Parameters
///
/// - `log_level`: default level if `RUST_LOG` env var is not set (e.g. `"info"`)
/// - `log_dir`: optional directory for daily-rotating log files
/// - `process_name`: used as the log file prefix (e.g. `"tape-collector"`)
pub fn init_logging(log_level: &str, log_dir: Option<&str>, process_name: &str) -> LogGuard {
    let console_layer = fmt::layer().with_target(true).with_ansi(true).compact();

    let (file_layer, file_worker) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, process_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(build_filter(log_level))
        .with(console_layer)
        .with(file_layer)
        .init();

    LogGuard { _file_worker: file_worker }
}
