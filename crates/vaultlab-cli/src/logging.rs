//! Log output for the CLI: `[LEVEL] message key=value` lines on stderr.

use std::fmt;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use crate::style;

/// Event formatter with a bracketed, optionally colored level prefix.
struct LabFormat {
    color: bool,
}

impl<S, N> FormatEvent<S, N> for LabFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let (label, color) = match *event.metadata().level() {
            Level::ERROR => ("ERROR", style::RED),
            Level::WARN => ("WARN", style::YELLOW),
            Level::INFO => ("INFO", style::GREEN),
            Level::DEBUG => ("DEBUG", style::CYAN),
            Level::TRACE => ("TRACE", style::DIM),
        };
        if self.color {
            write!(writer, "{color}[{label}]{} ", style::RESET)?;
        } else {
            write!(writer, "[{label}] ")?;
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the level chosen
/// by `verbose`.
pub fn init(verbose: bool, color: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,vaultlab_core={level},vault_lab_ctl={level}"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(color)
        .event_format(LabFormat { color })
        .init();
}
