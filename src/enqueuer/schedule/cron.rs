//! Five-field cron expressions.
//!
//! `minute hour day-of-month month day-of-week`, each field accepting `*`,
//! numbers, `a-b` ranges, `/step` suffixes and comma lists. Months and
//! weekdays also accept three-letter names; weekday `7` is Sunday. When both
//! day fields are restricted, a day matches if either does.
//!
//! Occurrences are computed in the subscription's timezone. Local times
//! skipped by a DST transition never fire; local times repeated by one fire
//! on their first occurrence only.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// How far ahead `next_after` searches before giving up.
const SEARCH_YEARS: i32 = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("{field} value {value} out of range {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("unknown macro '{0}'")]
    UnknownMacro(String),
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ],
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["sun", "mon", "tue", "wed", "thu", "fri", "sat"],
};

impl FieldSpec {
    fn value(&self, token: &str) -> Result<u32, CronError> {
        let lower = token.to_ascii_lowercase();
        if let Some(index) = self.names.iter().position(|name| *name == lower) {
            // Month names are 1-based, weekday names 0-based.
            return Ok(index as u32 + self.min);
        }
        let value: u32 = token.parse().map_err(|_| self.invalid(token))?;
        if value < self.min || value > self.max {
            return Err(CronError::OutOfRange {
                field: self.name,
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(value)
    }

    fn invalid(&self, value: &str) -> CronError {
        CronError::InvalidField {
            field: self.name,
            value: value.to_string(),
        }
    }

    /// Parse a field into a bitmask of allowed values.
    fn parse(&self, field: &str) -> Result<u64, CronError> {
        let mut mask = 0u64;
        for item in field.split(',') {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().map_err(|_| self.invalid(item))?;
                    if step == 0 || step > self.max - self.min + 1 {
                        return Err(self.invalid(item));
                    }
                    (range, Some(step))
                }
                None => (item, None),
            };

            let (start, end) = if range == "*" {
                (self.min, self.max)
            } else if let Some((a, b)) = range.split_once('-') {
                let (a, b) = (self.value(a)?, self.value(b)?);
                if a > b {
                    return Err(self.invalid(item));
                }
                (a, b)
            } else {
                let start = self.value(range)?;
                // `5/15` runs from 5 to the end of the range.
                (start, if step.is_some() { self.max } else { start })
            };

            let step = step.unwrap_or(1);
            let mut value = start;
            while value <= end {
                mask |= 1 << value;
                match value.checked_add(step) {
                    Some(next) => value = next,
                    None => break,
                }
            }
        }
        Ok(mask)
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    day_of_month_restricted: bool,
    day_of_week_restricted: bool,
    source: String,
}

impl CronSchedule {
    pub fn source(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month & (1 << date.day()) != 0;
        let dow = self.days_of_week & (1 << date.weekday().num_days_from_sunday()) != 0;
        match (self.day_of_month_restricted, self.day_of_week_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First occurrence strictly after `after`, evaluated in `tz`.
    ///
    /// Returns `None` if nothing matches within the search horizon
    /// (for example `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>, tz: &Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(tz).naive_local();
        let limit = local.year() + SEARCH_YEARS;
        let mut candidate = local.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);

        while candidate.year() <= limit {
            if self.months & (1 << candidate.month()) == 0 {
                candidate = first_of_next_month(candidate.date())?;
                continue;
            }
            if !self.day_matches(candidate.date()) {
                candidate = candidate.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if self.hours & (1 << candidate.hour()) == 0 {
                candidate = candidate.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if self.minutes & (1 << candidate.minute()) == 0 {
                candidate += Duration::minutes(1);
                continue;
            }

            if let Some(resolved) = resolve(tz, candidate, after) {
                return Some(resolved);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

/// Map a local wall time to the first matching instant after `after`.
fn resolve(tz: &Tz, local: NaiveDateTime, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let after_bound = |dt: DateTime<Tz>| {
        let utc = dt.with_timezone(&Utc);
        (utc > after).then_some(utc)
    };
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => after_bound(dt),
        LocalResult::Ambiguous(earliest, _) => after_bound(earliest),
        LocalResult::None => None,
    }
}

fn expand_macro(expression: &str) -> Result<&'static str, CronError> {
    match expression.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Ok("0 0 1 1 *"),
        "@monthly" => Ok("0 0 1 * *"),
        "@weekly" => Ok("0 0 * * 0"),
        "@daily" | "@midnight" => Ok("0 0 * * *"),
        "@hourly" => Ok("0 * * * *"),
        _ => Err(CronError::UnknownMacro(expression.to_string())),
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let source = s.trim();
        let expression = if source.starts_with('@') {
            expand_macro(source)?
        } else {
            source
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let mut days_of_week = DAY_OF_WEEK.parse(fields[4])?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            minutes: MINUTE.parse(fields[0])?,
            hours: HOUR.parse(fields[1])?,
            days_of_month: DAY_OF_MONTH.parse(fields[2])?,
            months: MONTH.parse(fields[3])?,
            days_of_week,
            day_of_month_restricted: !fields[2].starts_with('*'),
            day_of_week_restricted: !fields[4].starts_with('*'),
            source: source.to_string(),
        })
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
