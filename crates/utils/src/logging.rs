//! provides logging helpers

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Environment variable holding the log directives, e.g. `info,market=debug`.
pub const LOG_ENV: &str = "RUST_LOG";

/// Builds a filter from [`LOG_ENV`], falling back to `default` when unset.
///
/// Invalid directives are skipped rather than rejected.
pub fn env_filter(default: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_env_var(LOG_ENV)
        .with_default_directive(default.into())
        .from_env_lossy()
}

/// Parses explicit directives with the same fallback as [`env_filter`].
pub fn parse_filter(directives: &str, default: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default.into())
        .parse_lossy(directives)
}

/// initiate the global tracing subscriber, writing to stderr
pub fn init() {
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter(LevelFilter::INFO));

    registry().with(fmt_layer).init();
}
