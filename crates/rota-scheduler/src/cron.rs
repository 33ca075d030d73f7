//! Cron expression matcher.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Stanzas: N, A-B, */N, *, comma-separated lists of any of these.
//! Example: "0 8 * * 1-5" = weekdays at 8:00
//!
//! A schedule is five sets of admitted values; an instant matches when every
//! field admits it. No cron crate dependency.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use thiserror::Error;

/// Reasons a cron expression is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 fields in cron expression '{expr}', found {found}")]
    InvalidFieldCount { expr: String, found: usize },

    #[error("did not understand cron stanza '{0}'")]
    UnrecognizedStanza(String),

    #[error("cron stanza '{stanza}' is out of range {min}-{max}")]
    ValueOutOfRange { stanza: String, min: u32, max: u32 },
}

/// A parsed five-field cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    /// 0 = Sunday.
    days_of_week: BTreeSet<u32>,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::InvalidFieldCount {
                expr: expression.to_string(),
                found: parts.len(),
            });
        }

        Ok(Self {
            source: parts.join(" "),
            minutes: parse_field(parts[0], 0, 59)?,
            hours: parse_field(parts[1], 0, 23)?,
            days_of_month: parse_field(parts[2], 1, 31)?,
            months: parse_field(parts[3], 1, 12)?,
            days_of_week: parse_field(parts[4], 0, 6)?,
        })
    }

    /// Whether every field admits the given instant (seconds are ignored).
    pub fn matches<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        self.minutes.contains(&t.minute())
            && self.hours.contains(&t.hour())
            && self.day_matches(t.date_naive())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        self.days_of_month.contains(&date.day())
            && self.months.contains(&date.month())
            && self.days_of_week.contains(&date.weekday().num_days_from_sunday())
    }

    /// The first matching minute strictly after `after`, searching about four
    /// years ahead. Minutes that do not exist locally (DST gaps) are skipped.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let naive = after.naive_local();
        let start = naive.date().and_hms_opt(naive.hour(), naive.minute(), 0)? + Duration::minutes(1);
        let limit = start + Duration::days(4 * 366);

        let mut candidate: NaiveDateTime = start;
        while candidate < limit {
            if !self.day_matches(candidate.date()) {
                candidate = candidate.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(&candidate.hour()) {
                candidate = candidate.date().and_hms_opt(candidate.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if self.minutes.contains(&candidate.minute()) {
                if let Some(found) = tz.from_local_datetime(&candidate).earliest() {
                    return Some(found);
                }
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse one cron field into the set of values it admits.
fn parse_field(field: &str, min: u32, max: u32) -> Result<BTreeSet<u32>, CronError> {
    let mut values = BTreeSet::new();
    for stanza in field.split(',') {
        if stanza == "*" {
            values.extend(min..=max);
            continue;
        }

        // */N: every N from the lower bound
        if let Some(step) = stanza.strip_prefix("*/") {
            let n = parse_number(step, stanza)?;
            let n = check_range(n, 1, max, stanza)?;
            values.extend((min..=max).step_by(n as usize));
            continue;
        }

        // A-B, either order
        if let Some((start, end)) = stanza.split_once('-') {
            let start = check_range(parse_number(start, stanza)?, min, max, stanza)?;
            let end = check_range(parse_number(end, stanza)?, min, max, stanza)?;
            values.extend(start.min(end)..=start.max(end));
            continue;
        }

        let n = parse_number(stanza, stanza)?;
        values.insert(check_range(n, min, max, stanza)?);
    }
    Ok(values)
}

fn parse_number(digits: &str, stanza: &str) -> Result<u64, CronError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CronError::UnrecognizedStanza(stanza.to_string()));
    }
    // All-digit strings only fail to parse on overflow.
    Ok(digits.parse().unwrap_or(u64::MAX))
}

fn check_range(n: u64, min: u32, max: u32, stanza: &str) -> Result<u32, CronError> {
    if n < u64::from(min) || n > u64::from(max) {
        return Err(CronError::ValueOutOfRange {
            stanza: stanza.to_string(),
            min,
            max,
        });
    }
    Ok(n as u32)
}

/// When a job fires on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Recurrence {
    Cron(CronSchedule),
    /// No schedule: the job only runs on request.
    #[default]
    Never,
}

impl Recurrence {
    /// An empty expression means [`Recurrence::Never`].
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        if expression.trim().is_empty() {
            Ok(Recurrence::Never)
        } else {
            CronSchedule::parse(expression).map(Recurrence::Cron)
        }
    }

    pub fn matches<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        match self {
            Recurrence::Cron(schedule) => schedule.matches(t),
            Recurrence::Never => false,
        }
    }

    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        match self {
            Recurrence::Cron(schedule) => schedule.next_after(after),
            Recurrence::Never => None,
        }
    }
}
