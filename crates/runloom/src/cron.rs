//! Cron expression parsing and timezone-aware occurrence computation.
//!
//! Expressions are standard 5-field cron; a 6-field form with a leading
//! seconds field is also accepted. Evaluation happens in the schedule's
//! timezone, so "every day at 09:00" in `Europe/Paris` tracks DST.
//!
//! `chrono` types stay internal to this module; the rest of the crate works
//! with `time::OffsetDateTime` and conversion goes through unix timestamps.

use chrono::TimeZone;
use chrono_tz::Tz;
use time::OffsetDateTime;

use crate::error::{Error, Result};

/// A parsed, timezone-aware cron schedule.
pub struct CronSchedule {
    expression: String,
    cron: croner::Cron,
    tz: Tz,
}

impl CronSchedule {
    /// Parse an expression and timezone.
    ///
    /// 5-field expressions are normalized by prepending a `0` seconds field.
    pub fn parse(expression: &str, timezone: &str) -> Result<Self> {
        let normalized = normalize(expression)?;

        let tz: Tz = timezone.parse().map_err(|_| Error::InvalidCron {
            expression: expression.to_owned(),
            reason: format!("unknown timezone: {timezone}"),
        })?;

        let cron = croner::Cron::new(&normalized)
            .with_seconds_required()
            .parse()
            .map_err(|e| Error::InvalidCron {
                expression: expression.to_owned(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            expression: expression.to_owned(),
            cron,
            tz,
        })
    }

    /// The original (un-normalized) expression.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The next occurrence strictly after `after`, in UTC.
    ///
    /// Returns `None` for schedules that never fire again.
    pub fn next_after(&self, after: OffsetDateTime) -> Result<Option<OffsetDateTime>> {
        let from = chrono::DateTime::from_timestamp(after.unix_timestamp(), after.nanosecond())
            .ok_or_else(|| Error::InvalidCron {
                expression: self.expression.clone(),
                reason: "timestamp out of range".to_owned(),
            })?;
        let zoned = self.tz.from_utc_datetime(&from.naive_utc());

        let Some(next) = self.cron.iter_after(zoned).next() else {
            return Ok(None);
        };

        let next = OffsetDateTime::from_unix_timestamp(next.timestamp()).map_err(|e| {
            Error::InvalidCron {
                expression: self.expression.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(Some(next))
    }
}

/// Normalize an expression to the 6-field form croner parses.
fn normalize(expression: &str) -> Result<String> {
    let trimmed = expression.trim();
    let fields = trimmed.split_whitespace().count();
    match fields {
        // Standard 5-field cron -- prepend "0" for seconds.
        5 => Ok(format!("0 {trimmed}")),
        6 => Ok(trimmed.to_owned()),
        _ => Err(Error::InvalidCron {
            expression: expression.to_owned(),
            reason: format!("expected 5 or 6 fields, got {fields}"),
        }),
    }
}
