use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// Human date layouts accepted after ISO. `%B` also matches abbreviated month names.
const DATE_FORMATS: &[&str] = &["%d %B %Y", "%d %b %Y", "%m/%d/%Y"];

/// Half-open wall-clock interval `[start, end)` within a single calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn try_new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn covers(&self, inner: &TimeRange) -> bool {
        covers(self, inner)
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        overlaps(self, other)
    }

    /// Shares an endpoint with `other` without overlapping it.
    pub fn touches(&self, other: &TimeRange) -> bool {
        self.end == other.start || other.end == self.start
    }

    pub fn duration(&self) -> chrono::TimeDelta {
        self.end - self.start
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", format_time(self.start), format_time(self.end))
    }
}

pub fn covers(outer: &TimeRange, inner: &TimeRange) -> bool {
    outer.start <= inner.start && inner.end <= outer.end && inner.end > inner.start
}

/// Touching endpoints do not overlap.
pub fn overlaps(a: &TimeRange, b: &TimeRange) -> bool {
    a.start < b.end && b.start < a.end
}

/// Parse a calendar day from ISO (`2025-12-18`, or an ISO date-time whose date part is
/// taken verbatim) or one of the human layouts (`18 December 2025`, `18 Dec 2025`,
/// `12/18/2025`).
pub fn normalize_date(input: &str) -> Result<NaiveDate, FormatError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(FormatError::Date(input.to_string()));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.naive_local().date());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(dt.date());
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .ok_or_else(|| FormatError::Date(input.to_string()))
}

/// Parse `HH:mm:ss` or `HH:mm`. Fields must be zero-padded: `9:00` is rejected.
pub fn normalize_time(input: &str) -> Result<NaiveTime, FormatError> {
    let fmt = match input.len() {
        8 => "%H:%M:%S",
        5 => "%H:%M",
        _ => return Err(FormatError::Time(input.to_string())),
    };
    let well_formed = input.bytes().enumerate().all(|(i, b)| {
        if i % 3 == 2 {
            b == b':'
        } else {
            b.is_ascii_digit()
        }
    });
    if !well_formed {
        return Err(FormatError::Time(input.to_string()));
    }
    NaiveTime::parse_from_str(input, fmt)
        .ok()
        // chrono reads second 60 as a leap second.
        .filter(|time| time.nanosecond() < 1_000_000_000)
        .ok_or_else(|| FormatError::Time(input.to_string()))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn format_time(time: NaiveTime) -> String {
    time.format("%H:%M:%S").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    Date(String),
    Time(String),
}

impl std::fmt::Display for FormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormatError::Date(s) => write!(f, "invalid date format: {s:?}"),
            FormatError::Time(s) => write!(f, "invalid time format: {s:?} (expected HH:mm or HH:mm:ss)"),
        }
    }
}

impl std::error::Error for FormatError {}
