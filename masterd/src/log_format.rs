//! Custom `tracing_subscriber` event formatter producing the log line shape
//! from spec.md §6: `MMM DD HH:MM:SS host:port message`, with `host:port`
//! rendered as `-` when the event carries no remote-address field.

use std::fmt;

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::Event;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

const TIMESTAMP_FORMAT: &[time::format_description::FormatItem<'_>] =
    format_description!("[month repr:short] [day padding:space] [hour]:[minute]:[second]");

/// Recognised field names for the remote address, checked in order. Event
/// macros in this workspace log the peer under `src` (the protocol engine)
/// or `addr` (the aging pass and a few directory-wide handlers).
const ADDR_FIELDS: [&str; 2] = ["src", "addr"];

pub struct MasterLogFormat;

impl<S, N> FormatEvent<S, N> for MasterLogFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let now = OffsetDateTime::now_utc();
        let stamp = now
            .format(TIMESTAMP_FORMAT)
            .unwrap_or_else(|_| now.format(&Rfc3339).unwrap_or_default());

        let mut addr_visitor = AddrVisitor::default();
        event.record(&mut addr_visitor);
        let addr = addr_visitor.value.unwrap_or_else(|| "-".to_string());

        write!(writer, "{stamp} {addr} ")?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[derive(Default)]
struct AddrVisitor {
    value: Option<String>,
}

impl Visit for AddrVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if self.value.is_none() && ADDR_FIELDS.contains(&field.name()) {
            self.value = Some(format!("{value:?}").trim_matches('"').to_string());
        }
    }
}
