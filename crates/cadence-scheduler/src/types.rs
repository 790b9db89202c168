use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Natural key of a job: `(group, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub group: String,
    pub id: String,
}

impl JobKey {
    pub fn new(group: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.id)
    }
}

/// Primitive payload value handed to the job at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<bool> for DataValue {
    fn from(v: bool) -> Self {
        DataValue::Bool(v)
    }
}

impl From<i64> for DataValue {
    fn from(v: i64) -> Self {
        DataValue::Int(v)
    }
}

impl From<f64> for DataValue {
    fn from(v: f64) -> Self {
        DataValue::Float(v)
    }
}

impl From<&str> for DataValue {
    fn from(v: &str) -> Self {
        DataValue::Str(v.to_string())
    }
}

impl From<String> for DataValue {
    fn from(v: String) -> Self {
        DataValue::Str(v)
    }
}

pub type DataMap = BTreeMap<String, DataValue>;

/// Defines when a job fires. Exactly one fire-time rule per definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Repeat every `period_ms`. The first fire is `initial_delay_ms` after
    /// registration, or one full period when unset.
    Interval {
        period_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_delay_ms: Option<u64>,
    },

    /// Calendar expression, 5-field Unix or 6/7-field with seconds (UTC).
    Cron { expression: String },

    /// Fire a single time at the given UTC instant (immediately if already past).
    Once { at: DateTime<Utc> },
}

impl TriggerSpec {
    pub fn every(period: Duration) -> Self {
        TriggerSpec::Interval {
            period_ms: period.as_millis() as u64,
            initial_delay_ms: None,
        }
    }

    pub fn every_after(period: Duration, initial_delay: Duration) -> Self {
        TriggerSpec::Interval {
            period_ms: period.as_millis() as u64,
            initial_delay_ms: Some(initial_delay.as_millis() as u64),
        }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        TriggerSpec::Cron {
            expression: expression.into(),
        }
    }

    pub fn once(at: DateTime<Utc>) -> Self {
        TriggerSpec::Once { at }
    }
}

/// A registered unit of work and the rule for firing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub key: JobKey,
    /// Resolved by the job factory into an executable.
    pub job_type: String,
    pub trigger: TriggerSpec,
    /// Stay registered (dormant) once the trigger is exhausted.
    #[serde(default)]
    pub durable: bool,
    /// In clustered mode, fire on exactly one node rather than on every node.
    #[serde(default = "bool_true")]
    pub cluster_aware: bool,
    /// Allow overlapping firings of this job.
    #[serde(default)]
    pub concurrent: bool,
    #[serde(default)]
    pub data_map: DataMap,
}

fn bool_true() -> bool {
    true
}

impl JobDefinition {
    pub fn new(
        group: impl Into<String>,
        id: impl Into<String>,
        job_type: impl Into<String>,
        trigger: TriggerSpec,
    ) -> Self {
        Self {
            key: JobKey::new(group, id),
            job_type: job_type.into(),
            trigger,
            durable: false,
            cluster_aware: true,
            concurrent: false,
            data_map: DataMap::new(),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn cluster_aware(mut self, cluster_aware: bool) -> Self {
        self.cluster_aware = cluster_aware;
        self
    }

    pub fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<DataValue>) -> Self {
        self.data_map.insert(key.into(), value.into());
        self
    }
}

/// What caused a firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// The trigger's own schedule came due.
    Schedule,
    /// `trigger_now` was called.
    Manual,
    /// Re-fire of a clustered claim whose owner stopped renewing it.
    Recovery,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerSource::Schedule => "schedule",
            TriggerSource::Manual => "manual",
            TriggerSource::Recovery => "recovery",
        };
        write!(f, "{s}")
    }
}

/// Observable lifecycle state of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    /// Waiting for its next fire time.
    Scheduled,
    /// Promoted by the clock, waiting in the due queue for a worker.
    Due,
    /// A firing is executing.
    Firing,
    /// Suspended by `pause`; the definition is kept.
    Paused,
    /// Durable job whose trigger is exhausted; fires only on `trigger_now`.
    Dormant,
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerState::Scheduled => "scheduled",
            TriggerState::Due => "due",
            TriggerState::Firing => "firing",
            TriggerState::Paused => "paused",
            TriggerState::Dormant => "dormant",
        };
        write!(f, "{s}")
    }
}

/// How one firing ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum FireStatus {
    Succeeded,
    Failed { message: String },
    /// Cancelled by shutdown while executing.
    Cancelled,
    /// Discarded from the due queue by shutdown before it started.
    Abandoned,
}

/// Status snapshot of one registered job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub key: JobKey,
    pub job_type: String,
    pub trigger: TriggerSpec,
    pub state: TriggerState,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_status: Option<FireStatus>,
    /// Firings executed by this node.
    pub fire_count: u64,
    pub failure_count: u64,
    pub cluster_aware: bool,
}

/// A persisted claim on one firing (clustered mode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FireRecord {
    pub key: JobKey,
    pub fire_instance_id: String,
    pub acquired_by: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_defaults() {
        let def = JobDefinition::new("g", "a", "noop", TriggerSpec::every(Duration::from_secs(1)));
        assert!(def.cluster_aware);
        assert!(!def.durable);
        assert!(!def.concurrent);
        assert_eq!(def.key.to_string(), "g.a");
    }

    #[test]
    fn trigger_spec_serializes_with_kind_tag() {
        let json = serde_json::to_string(&TriggerSpec::every(Duration::from_millis(250))).unwrap();
        assert_eq!(json, r#"{"kind":"interval","period_ms":250}"#);

        let spec: TriggerSpec =
            serde_json::from_str(r#"{"kind":"cron","expression":"*/5 * * * *"}"#).unwrap();
        assert_eq!(spec, TriggerSpec::cron("*/5 * * * *"));
    }

    #[test]
    fn data_map_keeps_primitive_types() {
        let def = JobDefinition::new("g", "a", "noop", TriggerSpec::every(Duration::from_secs(1)))
            .with_data("limit", 10_i64)
            .with_data("dry_run", true)
            .with_data("target", "primary");

        let json = serde_json::to_string(&def.data_map).unwrap();
        let back: DataMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get("limit"), Some(&DataValue::Int(10)));
        assert_eq!(back.get("dry_run"), Some(&DataValue::Bool(true)));
        assert_eq!(back.get("target"), Some(&DataValue::Str("primary".into())));
    }
}
