use std::fmt::{self as stdfmt, Write as _};

use anyhow::Result;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use lazy_config::{LogFormat, LoggingConfig};

// ---------------------------------------------------------------------------
// DomainFormat — renders the `domain` field as a leading [domain] tag
// ---------------------------------------------------------------------------

/// Plain-text event formatter:
///
/// ```text
/// 2026-07-30T09:12:44Z  INFO [src] start tailing path="/var/log/app.log"
/// ```
///
/// Events without a `domain` field (dependency crates) render without the
/// prefix.
struct DomainFormat {
    timer: SystemTime,
}

impl<S, N> FormatEvent<S, N> for DomainFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> fmt::FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: fmt::format::Writer<'_>,
        event: &Event<'_>,
    ) -> stdfmt::Result {
        if self.timer.format_time(&mut writer).is_err() {
            write!(writer, "<unknown time>")?;
        }

        let level = *event.metadata().level();
        write!(writer, " {level:>5} ")?;

        let mut visitor = DomainExtractor::default();
        event.record(&mut visitor);

        if let Some(ref domain) = visitor.domain {
            write!(writer, "[{domain}] ")?;
        }
        write!(writer, "{}", visitor.message)?;
        if !visitor.other_fields.is_empty() {
            write!(writer, " {}", visitor.other_fields)?;
        }
        writeln!(writer)
    }
}

/// Visitor that pulls `domain` and `message` out of the event, collecting
/// everything else as `key=value` pairs.
#[derive(Default)]
struct DomainExtractor {
    domain: Option<String>,
    message: String,
    other_fields: String,
}

impl DomainExtractor {
    fn push_field(&mut self, name: &str, value: impl stdfmt::Debug) {
        if !self.other_fields.is_empty() {
            self.other_fields.push(' ');
        }
        write!(&mut self.other_fields, "{name}={value:?}").ok();
    }
}

impl Visit for DomainExtractor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "domain" => self.domain = Some(value.to_string()),
            "message" => self.message = value.to_string(),
            name => self.push_field(name, value),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn stdfmt::Debug) {
        match field.name() {
            "domain" => self.domain = Some(format!("{value:?}").trim_matches('"').to_string()),
            "message" => {
                write!(&mut self.message, "{value:?}").ok();
            }
            name => self.push_field(name, value),
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Initialise the `tracing` subscriber stack from [`LoggingConfig`].
///
/// Returns an optional [`WorkerGuard`] that must be held until process exit;
/// dropping it flushes the non-blocking file writer. `RUST_LOG` overrides
/// the config-driven filter when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let mut directives = config.level.clone();
        for (module, level) in &config.modules {
            directives.push(',');
            directives.push_str(module);
            directives.push('=');
            directives.push_str(level);
        }
        EnvFilter::try_new(&directives)
            .map_err(|e| anyhow::anyhow!("invalid log filter {directives:?}: {e}"))?
    };

    let is_json = config.format == LogFormat::Json;
    let mut guard = None;

    let file_layer = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("log file path has no file name"))?;
            let dir = path
                .parent()
                .ok_or_else(|| anyhow::anyhow!("log file path has no parent directory"))?;
            let appender = tracing_appender::rolling::never(dir, file_name.to_os_string());
            let (non_blocking, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);
            Some(non_blocking)
        }
        None => None,
    };

    if is_json {
        let stderr_layer = fmt::layer()
            .json()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(filter);
        match file_layer {
            Some(writer) => {
                let file_layer = fmt::layer()
                    .json()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(writer);
                tracing_subscriber::registry()
                    .with(stderr_layer)
                    .with(file_layer)
                    .init();
            }
            None => tracing_subscriber::registry().with(stderr_layer).init(),
        }
    } else {
        let stderr_layer = fmt::layer()
            .event_format(DomainFormat { timer: SystemTime })
            .with_writer(std::io::stderr)
            .with_filter(filter);
        match file_layer {
            Some(writer) => {
                let file_layer = fmt::layer()
                    .event_format(DomainFormat { timer: SystemTime })
                    .with_ansi(false)
                    .with_writer(writer);
                tracing_subscriber::registry()
                    .with(stderr_layer)
                    .with(file_layer)
                    .init();
            }
            None => tracing_subscriber::registry().with(stderr_layer).init(),
        }
    }

    Ok(guard)
}
