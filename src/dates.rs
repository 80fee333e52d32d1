//! Date helpers.
//!
//! Task dates are stored as epoch milliseconds, interpreted in local time.

use chrono::{DateTime, Duration, Local, LocalResult, Months, NaiveDate, NaiveDateTime, TimeZone};

use crate::error::{Error, Result};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parse `YYYY-MM-DD`, optionally followed by ` HH:MM` or `THH:MM[:SS]`.
pub fn parse_date(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, DATE_FORMAT) {
        return local_midnight(date);
    }
    for format in ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(raw, format) {
            return local_millis(datetime);
        }
    }
    None
}

pub fn local_midnight(date: NaiveDate) -> Option<i64> {
    date.and_hms_opt(0, 0, 0).and_then(local_millis)
}

pub fn local_millis(datetime: NaiveDateTime) -> Option<i64> {
    match Local.from_local_datetime(&datetime) {
        LocalResult::Single(value) => Some(value.timestamp_millis()),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.timestamp_millis()),
        LocalResult::None => None,
    }
}

pub fn to_local(millis: i64) -> Option<DateTime<Local>> {
    match Local.timestamp_millis_opt(millis) {
        LocalResult::Single(value) => Some(value),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => None,
    }
}

pub fn local_day(millis: i64) -> Option<NaiveDate> {
    to_local(millis).map(|value| value.date_naive())
}

/// Format as `YYYY-MM-DD`.
pub fn format_date(millis: i64) -> Option<String> {
    to_local(millis).map(|value| value.format(DATE_FORMAT).to_string())
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// A relative calendar offset such as `+3d`, `-1w` or `+2m`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateOffset {
    Days(i64),
    Weeks(i64),
    Months(i32),
    Years(i32),
}

impl DateOffset {
    /// Parse `[+-]N(d|w|m|y)`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let split = raw.char_indices().last().map(|(idx, _)| idx).unwrap_or(0);
        if split == 0 {
            return Err(Error::InvalidArgument(format!("invalid date offset '{raw}'")));
        }
        let (number, unit) = raw.split_at(split);
        let number = number.strip_prefix('+').unwrap_or(number);
        let value: i64 = number
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid date offset '{raw}'")))?;
        let months = i32::try_from(value)
            .map_err(|_| Error::InvalidArgument(format!("date offset out of range '{raw}'")))?;
        match unit {
            "d" | "D" => Ok(DateOffset::Days(value)),
            "w" | "W" => Ok(DateOffset::Weeks(value)),
            "m" | "M" => Ok(DateOffset::Months(months)),
            "y" | "Y" => Ok(DateOffset::Years(months)),
            _ => Err(Error::InvalidArgument(format!(
                "invalid date offset unit in '{raw}' (expected d|w|m|y)"
            ))),
        }
    }

    pub fn apply(&self, date: NaiveDate) -> Option<NaiveDate> {
        match *self {
            DateOffset::Days(days) => date.checked_add_signed(Duration::days(days)),
            DateOffset::Weeks(weeks) => date.checked_add_signed(Duration::weeks(weeks)),
            DateOffset::Months(months) => shift_months(date, months),
            DateOffset::Years(years) => shift_months(date, years.checked_mul(12)?),
        }
    }
}

fn shift_months(date: NaiveDate, months: i32) -> Option<NaiveDate> {
    if months >= 0 {
        date.checked_add_months(Months::new(months.unsigned_abs()))
    } else {
        date.checked_sub_months(Months::new(months.unsigned_abs()))
    }
}
