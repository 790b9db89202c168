use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use crate::error::{Result, SchedulerError};
use crate::types::{JobDefinition, TriggerSpec};

/// Result of advancing a trigger past a completed firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    pub next: DateTime<Utc>,
    /// The computed slot was already missed; `next` was pulled to "now".
    pub misfired: bool,
}

/// Longest interval period or initial delay accepted: 100 years.
pub const MAX_INTERVAL_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// Reject definitions the clock could never fire.
pub fn validate(def: &JobDefinition) -> Result<()> {
    if def.key.group.trim().is_empty() {
        return Err(SchedulerError::invalid(&def.key, "group must not be empty"));
    }
    if def.key.id.trim().is_empty() {
        return Err(SchedulerError::invalid(&def.key, "id must not be empty"));
    }
    if def.job_type.trim().is_empty() {
        return Err(SchedulerError::invalid(&def.key, "job type must not be empty"));
    }
    match &def.trigger {
        TriggerSpec::Interval {
            period_ms,
            initial_delay_ms,
        } => {
            if *period_ms == 0 {
                return Err(SchedulerError::invalid(&def.key, "interval period must be > 0"));
            }
            if *period_ms > MAX_INTERVAL_MS {
                return Err(SchedulerError::invalid(
                    &def.key,
                    format!("interval period must be <= {MAX_INTERVAL_MS}ms"),
                ));
            }
            if initial_delay_ms.is_some_and(|d| d > MAX_INTERVAL_MS) {
                return Err(SchedulerError::invalid(
                    &def.key,
                    format!("initial delay must be <= {MAX_INTERVAL_MS}ms"),
                ));
            }
        }
        TriggerSpec::Cron { expression } => {
            let schedule = parse_cron(expression)
                .map_err(|e| SchedulerError::invalid(&def.key, format!("bad cron expression: {e}")))?;
            if schedule.upcoming(Utc).next().is_none() {
                return Err(SchedulerError::invalid(&def.key, "cron expression never fires"));
            }
        }
        TriggerSpec::Once { .. } => {}
    }
    Ok(())
}

/// Parse a calendar expression.
///
/// The `cron` crate wants `sec min hour dom month dow [year]`; a standard
/// 5-field Unix expression gets a leading `0` seconds field.
pub fn parse_cron(expression: &str) -> std::result::Result<Schedule, cron::error::Error> {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        Schedule::from_str(&format!("0 {expression}"))
    } else {
        Schedule::from_str(expression)
    }
}

/// First fire time for a trigger registered at `registered_at`.
pub fn first_fire(spec: &TriggerSpec, registered_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match spec {
        TriggerSpec::Interval {
            period_ms,
            initial_delay_ms,
        } => {
            let delay = initial_delay_ms.unwrap_or(*period_ms);
            registered_at.checked_add_signed(millis(delay))
        }
        TriggerSpec::Cron { expression } => parse_cron(expression).ok()?.after(&registered_at).next(),
        // A past instant fires on the next scan.
        TriggerSpec::Once { at } => Some(*at),
    }
}

/// The slot following `anchor`. `None` when the trigger is exhausted.
pub fn next_after(spec: &TriggerSpec, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match spec {
        TriggerSpec::Interval { period_ms, .. } => anchor.checked_add_signed(millis(*period_ms)),
        TriggerSpec::Cron { expression } => parse_cron(expression).ok()?.after(&anchor).next(),
        TriggerSpec::Once { .. } => None,
    }
}

/// Pick the time a firing's cadence is measured from.
///
/// A firing that started more than `threshold` after its slot is a misfire:
/// the cadence restarts from the actual start so no backlog builds up.
pub fn cadence_anchor(
    scheduled_for: DateTime<Utc>,
    started_at: DateTime<Utc>,
    threshold: Duration,
) -> (DateTime<Utc>, bool) {
    if started_at - scheduled_for > threshold {
        (started_at, true)
    } else {
        (scheduled_for, false)
    }
}

/// Next fire time once a firing anchored at `anchor` has completed at `now`.
///
/// If the regular slot is already more than `threshold` in the past, fire
/// once immediately instead of replaying every missed slot.
pub fn advance(
    spec: &TriggerSpec,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> Option<Advance> {
    let next = next_after(spec, anchor)?;
    if now - next > threshold {
        Some(Advance { next: now, misfired: true })
    } else {
        Some(Advance { next, misfired: false })
    }
}

/// Saturates instead of wrapping to a negative span.
pub(crate) fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}
