//! Job types every node ships with.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_scheduler::{
    DataValue, Job, JobDefinition, JobError, JobExecutionContext, JobRegistry, TriggerSpec,
};
use tracing::info;

pub const STATUS_JOB_TYPE: &str = "node.status";
pub const LOG_JOB_TYPE: &str = "log";

/// Logs this node's view of the registered jobs.
struct StatusJob;

#[async_trait]
impl Job for StatusJob {
    async fn execute(&self, ctx: &JobExecutionContext) -> Result<(), JobError> {
        let jobs = ctx.scheduler().jobs();
        let failing = jobs.iter().filter(|j| j.failure_count > 0).count();
        info!(node = %ctx.node_id, jobs = jobs.len(), failing, "scheduler status");
        for job in &jobs {
            info!(
                job = %job.key,
                state = %job.state,
                next_fire = ?job.next_fire_time,
                fires = job.fire_count,
                failures = job.failure_count,
                "job status"
            );
        }
        Ok(())
    }
}

/// Logs the `message` entry of its data map.
struct LogJob;

#[async_trait]
impl Job for LogJob {
    async fn execute(&self, ctx: &JobExecutionContext) -> Result<(), JobError> {
        let message = match ctx.data("message") {
            Some(DataValue::Str(s)) => s.as_str(),
            Some(_) => return Err(JobError::failed("`message` must be a string")),
            None => return Err(JobError::failed("missing `message` in data map")),
        };
        info!(
            job = %ctx.key(),
            node = %ctx.node_id,
            fire_instance = %ctx.fire_instance_id,
            source = %ctx.source,
            "{message}"
        );
        Ok(())
    }
}

pub fn register_builtin(registry: &JobRegistry) {
    registry.register_instance(STATUS_JOB_TYPE, Arc::new(StatusJob));
    registry.register_instance(LOG_JOB_TYPE, Arc::new(LogJob));
}

pub fn builtin_definitions() -> Vec<JobDefinition> {
    vec![
        // every node reports on itself
        JobDefinition::new(
            "system",
            "status",
            STATUS_JOB_TYPE,
            TriggerSpec::every(Duration::from_secs(60)),
        )
        .cluster_aware(false),
        // one node per minute across the cluster
        JobDefinition::new("system", "heartbeat", LOG_JOB_TYPE, TriggerSpec::cron("* * * * *"))
            .with_data("message", "cluster heartbeat"),
    ]
}
