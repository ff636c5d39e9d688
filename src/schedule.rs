//! Schedule specification parsing.
//!
//! A schedule spec arrives as one of three shapes and resolves to a
//! [`Trigger`]:
//!
//! 1. **Absolute** — RFC 3339 or `YYYY-MM-DD HH:MM[:SS]` (assumed UTC).
//!    Unparsable input is a hard [`ScheduleParseError`].
//! 2. **Cron** — standard 5-field expression (minute, hour, day-of-month,
//!    month, day-of-week) producing a recurring trigger. Malformed fields
//!    are a hard error.
//! 3. **Relative phrase** — a small closed grammar (`in 30 minutes`,
//!    `tomorrow`, `next week`, `at 14:30`). Unrecognized phrases are not an
//!    error: [`parse_relative`] returns `None` so callers can treat phrase
//!    parsing as best-effort.

use crate::error::ScheduleParseError;
use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// A resolved schedule: a single instant or a recurring cron rule.
#[derive(Debug, Clone)]
pub enum Trigger {
    Once(DateTime<Utc>),
    Cron(CronTrigger),
}

impl Trigger {
    /// First fire time at or after task creation.
    pub fn initial_fire(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            // A one-shot instant already in the past is due immediately.
            Self::Once(at) => *at,
            Self::Cron(cron) => cron.next_after(now).unwrap_or(now),
        }
    }

    /// Next fire time strictly after `after`, or `None` when exhausted.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Once(at) => (*at > after).then_some(*at),
            Self::Cron(cron) => cron.next_after(after),
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, Self::Cron(_))
    }
}

/// A compiled recurring cron rule.
#[derive(Debug, Clone)]
pub struct CronTrigger {
    expression: String,
    schedule: CronSchedule,
}

impl CronTrigger {
    /// The original 5-field expression.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

/// Parse a schedule spec, trying cron, relative phrases, then absolute time.
pub fn parse_schedule(spec: &str) -> Result<Trigger, ScheduleParseError> {
    let spec = spec.trim();

    if looks_like_cron(spec) {
        return parse_cron(spec).map(Trigger::Cron);
    }

    if let Some(at) = parse_relative(spec, Utc::now()) {
        return Ok(Trigger::Once(at));
    }

    parse_absolute(spec).map(Trigger::Once)
}

/// Parse a standard 5-field cron expression into a recurring trigger.
pub fn parse_cron(expression: &str) -> Result<CronTrigger, ScheduleParseError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(ScheduleParseError::CronFieldCount {
            expression: expression.to_string(),
            found: fields.len(),
        });
    }

    // The cron crate wants a leading seconds field; pin it to zero so the
    // 5-field surface stays standard.
    let with_seconds = format!("0 {}", fields.join(" "));
    let schedule =
        CronSchedule::from_str(&with_seconds).map_err(|source| ScheduleParseError::Cron {
            expression: expression.to_string(),
            source,
        })?;

    Ok(CronTrigger {
        expression: expression.to_string(),
        schedule,
    })
}

/// Parse an absolute instant: RFC 3339, or a naive `YYYY-MM-DD HH:MM[:SS]`
/// interpreted as UTC.
pub fn parse_absolute(spec: &str) -> Result<DateTime<Utc>, ScheduleParseError> {
    if let Ok(at) = DateTime::parse_from_rfc3339(spec) {
        return Ok(at.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(spec, format) {
            return Ok(naive.and_utc());
        }
    }

    Err(ScheduleParseError::Unrecognized(spec.to_string()))
}

/// Resolve a relative phrase against `now` (UTC).
///
/// Grammar: `in N minute(s)/hour(s)/day(s)`, `tomorrow`, `next week`,
/// `at HH:MM`. Anything else returns `None`.
pub fn parse_relative(phrase: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let phrase = phrase.trim().to_lowercase();

    match phrase.as_str() {
        "tomorrow" => return Some(now + Duration::days(1)),
        "next week" => return Some(now + Duration::weeks(1)),
        _ => {}
    }

    if let Some(rest) = phrase.strip_prefix("in ") {
        let mut parts = rest.split_whitespace();
        let amount: i64 = parts.next()?.parse().ok()?;
        let unit = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        return match unit {
            "minute" | "minutes" | "min" | "mins" => Some(now + Duration::minutes(amount)),
            "hour" | "hours" => Some(now + Duration::hours(amount)),
            "day" | "days" => Some(now + Duration::days(amount)),
            _ => None,
        };
    }

    if let Some(rest) = phrase.strip_prefix("at ") {
        let time = NaiveTime::parse_from_str(rest.trim(), "%H:%M").ok()?;
        let candidate = now.date_naive().and_time(time).and_utc();
        // Already past today? Then the next occurrence is tomorrow.
        if candidate > now {
            return Some(candidate);
        }
        return Some(candidate + Duration::days(1));
    }

    None
}

fn looks_like_cron(spec: &str) -> bool {
    let fields: Vec<&str> = spec.split_whitespace().collect();
    // Alphanumerics cover named months/days (JAN, MON-FRI).
    fields.len() == 5
        && fields.iter().all(|f| {
            f.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '*' | '/' | ',' | '-'))
        })
}
