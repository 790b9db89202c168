use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::NodeId;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::backend::SchedulerHandle;
use crate::types::{DataMap, DataValue, JobDefinition, JobKey, TriggerSource};

/// Error returned by a job body. Contained at the firing boundary.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job failed: {0}")]
    Failed(String),

    /// The body observed the cancellation token and stopped early.
    #[error("Job cancelled")]
    Cancelled,
}

impl JobError {
    pub fn failed(message: impl std::fmt::Display) -> Self {
        JobError::Failed(message.to_string())
    }
}

/// A runnable unit of work produced by the job factory.
///
/// Bodies that run for a long time should poll
/// [`JobExecutionContext::is_cancelled`] (or await
/// [`JobExecutionContext::cancelled`]) and return [`JobError::Cancelled`]
/// once shutdown asks them to stop. In clustered mode a firing can be re-run
/// after a node crash, so bodies must tolerate re-execution.
#[async_trait]
pub trait Job: Send + Sync {
    async fn execute(&self, ctx: &JobExecutionContext) -> Result<(), JobError>;
}

/// Per-firing context handed to [`Job::execute`]. Dropped when the firing ends.
pub struct JobExecutionContext {
    pub definition: Arc<JobDefinition>,
    /// Identifies this firing; shared by every node that raced for it.
    pub fire_instance_id: String,
    pub scheduled_fire_time: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    pub source: TriggerSource,
    pub node_id: NodeId,
    cancellation: CancellationToken,
    scheduler: SchedulerHandle,
}

impl JobExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        definition: Arc<JobDefinition>,
        fire_instance_id: String,
        scheduled_fire_time: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        source: TriggerSource,
        node_id: NodeId,
        cancellation: CancellationToken,
        scheduler: SchedulerHandle,
    ) -> Self {
        Self {
            definition,
            fire_instance_id,
            scheduled_fire_time,
            fired_at,
            source,
            node_id,
            cancellation,
            scheduler,
        }
    }

    pub fn key(&self) -> &JobKey {
        &self.definition.key
    }

    pub fn data_map(&self) -> &DataMap {
        &self.definition.data_map
    }

    pub fn data(&self, key: &str) -> Option<&DataValue> {
        self.definition.data_map.get(key)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once shutdown asks running firings to stop.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Handle for registering, pausing or triggering jobs from inside a job.
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }
}
