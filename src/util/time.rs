//! Timestamp parsing shared by change-capture payloads and cache hashes.

use time::{
    OffsetDateTime, PrimitiveDateTime, format_description::BorrowedFormatItem,
    format_description::well_known::Rfc3339, macros::format_description,
};

const NAIVE_LAYOUT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Parse a timestamp in one of the accepted layouts.
///
/// Accepted, in order: `YYYY-MM-DD HH:MM:SS` (read as UTC), ISO-8601 with `Z`, and ISO-8601 with
/// an explicit offset.
pub fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, time::error::Parse> {
    let raw = raw.trim();
    match PrimitiveDateTime::parse(raw, NAIVE_LAYOUT) {
        Ok(naive) => Ok(naive.assume_utc()),
        Err(_) => OffsetDateTime::parse(raw, &Rfc3339),
    }
}

/// Render a timestamp as RFC 3339, falling back to unix seconds for out-of-range years.
pub fn format_timestamp(value: OffsetDateTime) -> String {
    value
        .format(&Rfc3339)
        .unwrap_or_else(|_| value.unix_timestamp().to_string())
}
