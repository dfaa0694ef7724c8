//! Epoch-second helpers and calendar period alignment (UTC).

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime};

pub const HOUR_SECS: i64 = 3_600;
pub const DAY_SECS: i64 = 86_400;
pub const WEEK_SECS: i64 = 7 * DAY_SECS;

/// Calendar period used to align sub-windows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Day,
    Week,
    Month,
}

impl Period {
    /// Start of the period containing `ts`. Weeks start on Monday.
    pub fn floor(self, ts: i64) -> i64 {
        match self {
            Period::Day => ts - ts.rem_euclid(DAY_SECS),
            Period::Week => {
                // 1970-01-01 was a Thursday: three days past a Monday.
                let days = ts.div_euclid(DAY_SECS);
                let since_monday = (days + 3).rem_euclid(7);
                (days - since_monday) * DAY_SECS
            }
            Period::Month => {
                let date = to_datetime(ts).date();
                month_start(date.year(), date.month()).unwrap_or(ts)
            }
        }
    }

    /// First period boundary strictly after `ts`, or `None` past the last representable date.
    pub fn next_boundary(self, ts: i64) -> Option<i64> {
        let date = OffsetDateTime::from_unix_timestamp(ts).ok()?.date();
        let next = match self {
            Period::Day => self.floor(ts).checked_add(DAY_SECS),
            Period::Week => self.floor(ts).checked_add(WEEK_SECS),
            Period::Month => {
                let (year, month) = match date.month() {
                    Month::December => (date.year() + 1, Month::January),
                    m => (date.year(), m.next()),
                };
                month_start(year, month)
            }
        };
        next.filter(|&b| b > ts && OffsetDateTime::from_unix_timestamp(b).is_ok())
    }

    pub fn api_name(self) -> &'static str {
        match self {
            Period::Day => "day",
            Period::Week => "week",
            Period::Month => "month",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_name())
    }
}

impl FromStr for Period {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "day" | "daily" => Ok(Period::Day),
            "week" | "weekly" => Ok(Period::Week),
            "month" | "monthly" => Ok(Period::Month),
            other => Err(format!("unknown period '{other}' (expected day, week or month)")),
        }
    }
}

/// Time filter of ranked listings. The API counts each span back from the moment of the
/// request, not from a sub-window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFilter {
    Day,
    Week,
    Month,
    Year,
    All,
}

impl TimeFilter {
    pub fn span_secs(self) -> Option<i64> {
        match self {
            TimeFilter::Day => Some(DAY_SECS),
            TimeFilter::Week => Some(WEEK_SECS),
            TimeFilter::Month => Some(30 * DAY_SECS),
            TimeFilter::Year => Some(365 * DAY_SECS),
            TimeFilter::All => None,
        }
    }

    /// Narrowest filter that still reaches `age_secs` into the past.
    pub fn covering(age_secs: i64) -> Self {
        [TimeFilter::Day, TimeFilter::Week, TimeFilter::Month, TimeFilter::Year]
            .into_iter()
            .find(|f| f.span_secs().is_some_and(|span| span >= age_secs))
            .unwrap_or(TimeFilter::All)
    }

    pub fn api_name(self) -> &'static str {
        match self {
            TimeFilter::Day => "day",
            TimeFilter::Week => "week",
            TimeFilter::Month => "month",
            TimeFilter::Year => "year",
            TimeFilter::All => "all",
        }
    }
}

impl fmt::Display for TimeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_name())
    }
}

fn month_start(year: i32, month: Month) -> Option<i64> {
    Date::from_calendar_date(year, month, 1)
        .ok()
        .map(|d| d.midnight().assume_utc().unix_timestamp())
}

pub fn to_datetime(ts: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub fn now_ts() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Parse `YYYY-MM-DD` (midnight UTC) or a full RFC 3339 timestamp.
pub fn parse_timestamp(s: &str) -> Result<OffsetDateTime> {
    let s = s.trim();
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc3339) {
        return Ok(dt);
    }
    let day = format_description!("[year]-[month]-[day]");
    Date::parse(s, &day)
        .map(|d| d.midnight().assume_utc())
        .map_err(|_| anyhow!("invalid timestamp '{s}': expected YYYY-MM-DD or RFC 3339"))
}

/// RFC 3339 rendering for logs; falls back to the raw number.
pub fn format_ts(ts: i64) -> String {
    to_datetime(ts).format(&Rfc3339).unwrap_or_else(|_| ts.to_string())
}
