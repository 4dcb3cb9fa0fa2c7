use time::macros::format_description;
use time::OffsetDateTime;

/// Wall-clock time in the local offset, falling back to UTC when the local
/// offset cannot be determined (e.g. multi-threaded process on Unix).
pub(crate) fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// `YYYY-MM-DD HH:MM:SS`, used for history lines.
pub(crate) fn format_seconds(at: OffsetDateTime) -> String {
    at.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ))
    .unwrap_or_default()
}

/// `YYYY-MM-DD HH:MM:SS.ffffff`, used for threshold issue timestamps.
pub(crate) fn format_micros(at: OffsetDateTime) -> String {
    at.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]"
    ))
    .unwrap_or_default()
}
