use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CronError {
    #[error("Invalid cron expression: {0}")]
    InvalidExpression(String),
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("Cron expression {0} has no upcoming execution")]
    Exhausted(String),
}

/// Represents a cron schedule with timezone support.
///
/// Both the classic five-field form (`min hour dom month dow`) and the
/// six/seven-field form with a leading seconds column are accepted. Five-field
/// expressions fire at second zero.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    pub expression: String,
    pub timezone: String,
    schedule: Schedule,
    tz: Tz,
}

impl CronSchedule {
    /// Create a new CronSchedule with UTC timezone
    pub fn new(expression: &str) -> Result<Self, CronError> {
        Self::with_timezone(expression, "UTC")
    }

    /// Create a new CronSchedule with a specific timezone
    pub fn with_timezone(expression: &str, timezone: &str) -> Result<Self, CronError> {
        let schedule = parse_schedule(expression)?;

        let tz = timezone
            .parse::<Tz>()
            .map_err(|_| CronError::InvalidTimezone(timezone.to_string()))?;

        Ok(CronSchedule {
            expression: expression.trim().to_string(),
            timezone: timezone.to_string(),
            schedule,
            tz,
        })
    }

    /// Get the next execution time strictly after the given datetime
    pub fn next_execution(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let after_tz = after.with_timezone(&self.tz);
        let next_tz = self.schedule.after(&after_tz).next()?;

        Some(next_tz.with_timezone(&Utc))
    }

    /// Like [`next_execution`](Self::next_execution) but reports an exhausted
    /// schedule as an error, for callers that must re-arm a record.
    pub fn require_next_execution(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        self.next_execution(after)
            .ok_or_else(|| CronError::Exhausted(self.expression.clone()))
    }
}

/// Expands a five-field expression to the seconds-first form the parser expects.
fn normalize_expression(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

fn parse_schedule(expression: &str) -> Result<Schedule, CronError> {
    Schedule::from_str(&normalize_expression(expression))
        .map_err(|e| CronError::InvalidExpression(format!("{}: {}", expression, e)))
}

/// Schedules used by the built-in recurring jobs.
pub mod presets {
    use super::CronSchedule;

    /// Expression for the nightly file cleanup.
    pub const DAILY_AT_2AM: &str = "0 2 * * *";

    pub fn daily_at_2am() -> CronSchedule {
        CronSchedule::new(DAILY_AT_2AM).expect("preset cron expression is valid")
    }
}
