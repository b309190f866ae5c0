//! Log sink for the daemon.
//!
//! Every record is written as `<timestamp> <level> [<module>] <message>`.
//! Continuation lines of a multi-line message are written as-is.
//!
//! The libraries log through the `log` facade; those records are bridged into
//! the `tracing` subscriber installed here.

use std::fmt::{self, Write as _};

use chrono::{SecondsFormat, Utc};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_log::NormalizeEvent;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt as tfmt, EnvFilter};

/// Target prefix for lines forwarded from clients.
pub const CLIENT_TARGET_PREFIX: &str = "CLIENT:";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("failed to install logger: {0}")]
    Install(#[from] TryInitError),
}

/// Build the filter for a directive string such as `info` or
/// `tether_pty=debug,info`.
pub fn filter(directives: &str) -> Result<EnvFilter, LoggingError> {
    Ok(EnvFilter::try_new(directives)?)
}

/// Install the stderr sink and bridge `log` records into it.
pub fn init(directives: &str) -> Result<(), LoggingError> {
    tracing_subscriber::registry()
        .with(filter(directives)?)
        .with(
            tfmt::layer()
                .event_format(LineFormat)
                .with_writer(std::io::stderr),
        )
        .try_init()?;
    Ok(())
}

/// Event formatter producing the daemon's line layout.
pub struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let normalized = event.normalized_metadata();
        let metadata = normalized.as_ref().unwrap_or_else(|| event.metadata());

        let mut message = MessageVisitor::default();
        event.record(&mut message);

        writer.write_str(&format_record(
            &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            *metadata.level(),
            metadata.target(),
            &message.finish(),
        ))
    }
}

/// Collects the `message` field, then any structured fields as `key=value`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            self.message + &self.fields
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else if !field.name().starts_with("log.") {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else if !field.name().starts_with("log.") {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}

/// Render one record, newline terminated.
pub fn format_record(timestamp: &str, level: Level, module: &str, message: &str) -> String {
    let mut out = String::with_capacity(message.len() + module.len() + 40);
    let mut lines = message.lines();
    let first = lines.next().unwrap_or("");
    out.push_str(&format!("{timestamp} {level} [{module}] {first}\n"));
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Parse a client-supplied level name, defaulting to info.
pub fn parse_level(name: &str) -> log::Level {
    name.parse().unwrap_or(log::Level::Info)
}

/// Log a line on behalf of a connected client.
pub fn log_client(client: &str, level: log::Level, message: &str) {
    let target = format!("{CLIENT_TARGET_PREFIX}{client}");
    log::log!(target: &target, level, "{message}");
}
