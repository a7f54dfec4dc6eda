//! Lenient numeric coercion of raw sensor strings

use obd_protocol::split_leading_number;

/// Coerce a raw reading to a number.
///
/// Takes the leading number, ignoring any unit that follows it with or
/// without a space. Absent values, text without a leading number and
/// non-finite numbers all become `0.0`. Never panics.
pub fn coerce(raw: Option<&str>) -> f64 {
    raw.and_then(split_leading_number)
        .map_or(0.0, |(value, _)| value)
}
