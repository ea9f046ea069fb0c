//! Thin wrapper around the `cron` crate's richer feature surface, narrowed
//! down to the standard 5-field expression (minute hour day-of-month month
//! day-of-week) the spec requires. `*/n` and comma lists are required;
//! ranges are accepted as a superset the underlying crate already supports.

use chrono::{DateTime, Utc};
use std::str::FromStr;

use crate::error::{Error, ErrorKind};

/// Validates and wraps a 5-field cron expression.
pub struct CronSchedule {
    inner: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> crate::Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::new(
                ErrorKind::Other,
                anyhow::anyhow!(
                    "cron expression must have exactly 5 fields (minute hour dom month dow), got {}: {:?}",
                    fields.len(),
                    expression
                ),
            ));
        }

        // The `cron` crate parses the traditional 6/7-field format with a
        // leading seconds field; we fix seconds at 0 to express the
        // standard 5-field contract the spec requires.
        let six_field = format!("0 {expression}");
        let inner = cron::Schedule::from_str(&six_field).map_err(|e| {
            Error::new(
                ErrorKind::Other,
                anyhow::anyhow!("invalid cron expression {expression:?}: {e}"),
            )
        })?;

        Ok(Self { inner })
    }

    /// The next fire time strictly after `from`.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.inner.after(&from).next()
    }
}

/// Convenience function used by the Scheduler: parse `expression` and
/// return its next fire time after `from`.
pub fn next_after(expression: &str, from: DateTime<Utc>) -> crate::Result<DateTime<Utc>> {
    let schedule = CronSchedule::parse(expression)?;
    schedule.next_after(from).ok_or_else(|| {
        Error::new(
            ErrorKind::Other,
            anyhow::anyhow!("cron expression {expression:?} has no future occurrence"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn every_minute() {
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = next_after("* * * * *", from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 0, 1, 0).unwrap());
    }

    #[test]
    fn every_n_minutes() {
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = next_after("*/15 * * * *", from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 0, 15, 0).unwrap());
    }

    #[test]
    fn comma_list_of_hours() {
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = next_after("0 6,18 * * *", from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 6, 0, 0).unwrap());
    }

    #[test]
    fn rejects_wrong_field_count() {
        let err = CronSchedule::parse("* * * *").unwrap_err();
        assert!(err.to_string().contains("5 fields"));
    }
}
