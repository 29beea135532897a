//! Stderr diagnostics for the multiplexer.
//!
//! Every line has the shape `<tag>[<HH:MM:SS.mmm>] <message>` where the tag
//! is a one-character level indicator:
//!
//! | tag | meaning |
//! |-----|---------|
//! | `W` | warning (message additionally prefixed `WARN: `) |
//! | `i` | lifecycle and routing decisions |
//! | `e` | protocol event: one JSON-RPC message crossing the multiplexer |
//! | `d` | debug |
//! | `t` | trace |
//!
//! Protocol events are ordinary `tracing` debug records emitted under the
//! `chorus::wire` target; the `event` verbosity level enables exactly that
//! target on top of `info`, so wire traffic can be watched without the rest
//! of the debug output.
//!
//! Everything goes to stderr: stdout belongs to the client's JSON-RPC
//! stream.

use chrono::Local;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    registry::LookupSpan,
    EnvFilter,
};

/// The `tracing` target carrying protocol events (tag `e`).
pub const WIRE_TARGET: &str = "chorus::wire";

/// Verbosity selected with `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Silent,
    Warn,
    Info,
    Event,
    Debug,
    Trace,
}

impl LogLevel {
    /// The filter directive implementing this level.
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Silent => "off",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Event => "info,chorus::wire=debug",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "silent" => Ok(LogLevel::Silent),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "event" => Ok(LogLevel::Event),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!(
                "unknown log level `{s}` (expected silent|warn|info|event|debug|trace)"
            )),
        }
    }
}

/// Install the stderr subscriber.
///
/// `max_line_length` truncates each formatted message at that many bytes;
/// 0 disables truncation.
///
/// Safe to call more than once -- later calls are ignored.
pub fn init(level: LogLevel, max_line_length: usize) {
    let _ = tracing_subscriber::fmt()
        .event_format(TagFormat { max_line_length })
        .with_env_filter(EnvFilter::new(level.directive()))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Initialize logging for tests: stderr at debug, no truncation.
pub fn test() {
    init(LogLevel::Debug, 0);
}

struct TagFormat {
    max_line_length: usize,
}

impl<S, N> FormatEvent<S, N> for TagFormat
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
        use fmt::Write as _;

        let meta = event.metadata();
        let level = *meta.level();
        let warnish = level == Level::ERROR || level == Level::WARN;
        let tag = if warnish {
            'W'
        } else if level == Level::INFO {
            'i'
        } else if level == Level::DEBUG {
            if meta.target() == WIRE_TARGET {
                'e'
            } else {
                'd'
            }
        } else {
            't'
        };

        let mut text = String::new();
        if warnish {
            text.push_str("WARN: ");
        }
        event.record(&mut MessageExtractor(&mut text));

        let timestamp = Local::now().format("%H:%M:%S%.3f");
        writeln!(
            writer,
            "{tag}[{timestamp}] {}",
            truncate_line(&text, self.max_line_length)
        )
    }
}

/// Collects the `message` field of an event; other fields are dropped.
struct MessageExtractor<'a>(&'a mut String);

impl tracing::field::Visit for MessageExtractor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        use fmt::Write as _;
        if field.name() == "message" {
            let _ = write!(self.0, "{value:?}");
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.0.push_str(value);
        }
    }
}

fn truncate_line(text: &str, max: usize) -> String {
    if max == 0 || text.len() <= max {
        return text.to_owned();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} bytes total)", &text[..end], text.len())
}
