use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::{FmtContext, FormattedFields};
use tracing_subscriber::registry::LookupSpan;

/// A custom tracing event formatter for colorizing log output based on level.
///
/// Lines carry no timestamp or level. The enclosing spans are printed first,
/// outermost to innermost, so every line of a run is prefixed with its run
/// id and, inside an iteration, the iteration number:
///
/// ```text
/// run{run_id=1b9d6bcd kind=boot shape=m5.large}: iteration{n=2}: Instance created instance=i-0abc
/// ```
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
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
        // Buffered so the whole line can be colored at once.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(buf_writer, "{}", span.name())?;
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(buf_writer, "{{{}}}", fields)?;
                    }
                }
                write!(buf_writer, ": ")?;
            }
        }
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}

/// Default filter directive for the `-v`/`-q` flags. `RUST_LOG` wins over it.
pub fn level_directive(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "warn";
    }
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}
