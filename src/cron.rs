use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

#[derive(Debug, thiserror::Error)]
#[error("invalid cron expression: {0}")]
pub struct CronParseError(String);

/// Parse a standard five-field cron expression (minute, hour, day of month,
/// month, day of week). The `cron` crate wants a seconds field, so a zero
/// seconds column is prepended before parsing.
pub fn parse_five_field(expr: &str) -> Result<Schedule, CronParseError> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    if fields != 5 {
        return Err(CronParseError(format!(
            "expected 5 fields, got {fields} in {trimmed:?}"
        )));
    }
    Schedule::from_str(&format!("0 {trimmed}")).map_err(|e| CronParseError(e.to_string()))
}

/// Evaluates schedules over half-open tick intervals in a configured zone.
///
/// A schedule fires in `(t1, t2]` iff its next match strictly after `t1`
/// is at or before `t2`. Firing stays idempotent under variable tick
/// latency: adjacent intervals never observe the same match twice.
#[derive(Debug, Clone, Copy)]
pub struct CronEvaluator {
    tz: Tz,
}

impl CronEvaluator {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn fires_between(
        &self,
        schedule: &Schedule,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> bool {
        let after_local = after.with_timezone(&self.tz);
        schedule
            .after(&after_local)
            .next()
            .map(|next| next.with_timezone(&Utc) <= until)
            .unwrap_or(false)
    }

    /// Next match strictly after `reference`, if any. Used for the startup
    /// schedule summary.
    pub fn next_fire(
        &self,
        schedule: &Schedule,
        reference: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let reference_local = reference.with_timezone(&self.tz);
        schedule
            .after(&reference_local)
            .next()
            .map(|next| next.with_timezone(&Utc))
    }
}
