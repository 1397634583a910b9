//! `tracing` glue for the rotating sink.

use std::io;
use std::sync::Arc;

use chrono::Local;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use super::RotatingSink;

/// Event formatter producing `YYYY-MM-DD HH:MM:SS.uuuuuu [lvl]: msg` lines.
#[derive(Debug, Clone, Default)]
pub struct PlainFormat;

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        // The sink has no tag below debug.
        Level::DEBUG | Level::TRACE => "debug",
    }
}

impl<S, N> FormatEvent<S, N> for PlainFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let now = Local::now();
        write!(
            writer,
            "{} [{}]: ",
            now.format("%Y-%m-%d %H:%M:%S%.6f"),
            level_tag(*event.metadata().level()),
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// `MakeWriter` handing each formatted event to a [`RotatingSink`] as one
/// record.
#[derive(Debug, Clone)]
pub struct SinkWriter {
    sink: Arc<RotatingSink>,
}

impl SinkWriter {
    /// Wrap a sink for use with `tracing_subscriber::fmt`.
    pub fn new(sink: Arc<RotatingSink>) -> Self {
        Self { sink }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SinkWriter {
    type Writer = RecordWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RecordWriter {
            sink: Arc::clone(&self.sink),
            buf: Vec::with_capacity(256),
        }
    }
}

/// Buffers one formatted event and submits it on drop.
#[derive(Debug)]
pub struct RecordWriter {
    sink: Arc<RotatingSink>,
    buf: Vec<u8>,
}

impl io::Write for RecordWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for RecordWriter {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            self.sink.write_record(&String::from_utf8_lossy(&self.buf));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_tags_match_sink_contract() {
        assert_eq!(level_tag(Level::ERROR), "error");
        assert_eq!(level_tag(Level::WARN), "warn");
        assert_eq!(level_tag(Level::INFO), "info");
        assert_eq!(level_tag(Level::DEBUG), "debug");
        assert_eq!(level_tag(Level::TRACE), "debug");
    }
}
