// libs/appointment-cell/src/canonical.rs
//! Normalization of booking dates and times into the forms used for slot equality.
//!
//! Dates never pass through a timezone conversion: `2025-06-01T23:30:00-05:00` is
//! the calendar date the client wrote, `2025-06-01`, not the UTC instant's date.

use chrono::{NaiveDate, NaiveTime};

use crate::models::BookingError;

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
    "%A, %B %d, %Y",
];

const TIME_FORMATS: &[&str] = &[
    "%H:%M",
    "%H:%M:%S",
    "%H:%M:%S%.f",
    "%I:%M %p",
    "%I:%M%p",
    "%I:%M:%S %p",
];

/// Returns the date as `YYYY-MM-DD`.
pub fn canonical_date(input: &str) -> Result<String, BookingError> {
    let trimmed = input.trim();

    // ISO timestamps: keep the written calendar date.
    let candidate = match trimmed.split_once('T') {
        Some((date, _)) if date.len() == 10 => date,
        _ => trimmed,
    };

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(candidate, fmt).ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
        .ok_or_else(|| BookingError::Validation(format!("Unrecognized date: {}", input)))
}

/// Returns the time as zero-padded 24-hour `HH:MM`.
pub fn canonical_time(input: &str) -> Result<String, BookingError> {
    let trimmed = input.trim();
    let upper = trimmed.to_ascii_uppercase();

    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(&upper, fmt).ok())
        .map(|time| time.format("%H:%M").to_string())
        .ok_or_else(|| BookingError::Validation(format!("Unrecognized time: {}", input)))
}
