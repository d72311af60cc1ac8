//! Tracing setup for hosts embedding cairn.
//!
//! Reads `RUST_LOG`; defaults to `cairn=info` (`cairn=debug` when verbose).
//! Console output goes to stderr. When a log directory is given, a
//! non-blocking file layer writes daily-rotated `cairn.log` files there.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub verbose: bool,
    /// Emit JSON lines instead of the compact format
    pub json: bool,
    pub log_dir: Option<PathBuf>,
}

fn default_filter(verbose: bool) -> EnvFilter {
    let fallback = if verbose { "cairn=debug" } else { "cairn=info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the global subscriber.
///
/// Returns the file appender guard, which must be held for the life of the
/// process so buffered lines are flushed. Calling `init` twice is harmless:
/// the second call leaves the first subscriber in place.
pub fn init(options: &LogOptions) -> Option<WorkerGuard> {
    let console = if options.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "cairn.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(default_filter(options.verbose))
        .with(console)
        .with(file_layer)
        .try_init();

    guard
}
