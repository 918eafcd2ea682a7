//! provides logging helpers

use std::fmt::{self};
use std::path::Path;

use anyhow::Context;
use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Metadata;
use tracing::Subscriber;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::format;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Events with a target below this prefix are metrics lines.
pub const METRICS_TARGET_PREFIX: &str = "metrics";

const DEFAULT_METRICS_FILE: &str = "/logs/metrics.log";

/// Writes the pre-encoded metrics line carried by the event verbatim.
struct MetricsLineFormatter;

struct FieldVisitor {
    msg: String,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, _: &Field, value: &str) {
        self.msg.push_str(value);
    }

    fn record_debug(&mut self, _: &Field, value: &dyn fmt::Debug) {
        self.msg.push_str(&format!("{value:?}"));
    }
}

impl<S, N> FormatEvent<S, N> for MetricsLineFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldVisitor { msg: String::new() };
        event.record(&mut visitor);
        write!(writer, "{}", visitor.msg)
    }
}

pub fn is_metrics_target(metadata: &Metadata<'_>) -> bool {
    metadata.target().starts_with(METRICS_TARGET_PREFIX)
}

/// initiate the global tracing subscriber
///
/// Regular events go to stderr, filtered by `RUST_LOG`; metrics events go to
/// a daily-rotated file next to `metrics_file`.
pub fn init<P: AsRef<Path>>(
    metrics_file: Option<P>,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let metrics_file = metrics_file
        .as_ref()
        .map(|p| p.as_ref())
        .unwrap_or(Path::new(DEFAULT_METRICS_FILE));

    let dir = metrics_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = metrics_file
        .file_name()
        .and_then(|f| f.to_str())
        .context("metrics file must name a file")?;

    let env_filter = utils::logging::env_filter(filter::LevelFilter::INFO);
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter.and(filter::filter_fn(|metadata| {
            !is_metrics_target(metadata)
        })));

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(dir)
        .with_context(|| format!("failed to create metrics appender in {}", dir.display()))?;

    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let metrics_layer = layer()
        .event_format(MetricsLineFormatter)
        .fmt_fields(format::DefaultFields::new())
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(is_metrics_target));

    registry().with(fmt_layer).with(metrics_layer).init();
    Ok(file_guard)
}
