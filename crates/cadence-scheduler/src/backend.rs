use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::{NodeId, SchedulerMode};

use crate::error::{Result, SchedulerError};
use crate::trigger;
use crate::types::{JobDefinition, JobKey, JobSummary};

/// A scheduling backend. The facade holds exactly one, chosen at start.
///
/// Methods returning `bool` report whether the job was known.
#[async_trait]
pub trait SchedulerBackend: Send + Sync {
    fn mode(&self) -> SchedulerMode;

    fn node_id(&self) -> &NodeId;

    /// Spawn the clock and worker tasks. Must run inside a Tokio runtime.
    fn start(&self) -> Result<()>;

    /// Add or replace a job. The definition has already been validated.
    fn register(&self, definition: JobDefinition) -> Result<()>;

    fn unregister(&self, key: &JobKey) -> Result<bool>;

    fn pause(&self, key: &JobKey) -> Result<bool>;

    fn resume(&self, key: &JobKey) -> Result<bool>;

    fn trigger_now(&self, key: &JobKey) -> Result<bool>;

    fn jobs(&self) -> Vec<JobSummary>;

    /// Stop firing, wait up to `timeout` for in-flight firings, then cancel
    /// the rest and report [`SchedulerError::ShutdownIncomplete`].
    async fn shutdown(&self, timeout: Duration) -> Result<()>;
}

/// Weak handle to the running backend, given to jobs through their context.
///
/// Weak so a job that stashes the handle does not keep a stopped scheduler alive.
#[derive(Clone)]
pub struct SchedulerHandle {
    backend: Weak<dyn SchedulerBackend>,
}

impl SchedulerHandle {
    pub(crate) fn new(backend: Weak<dyn SchedulerBackend>) -> Self {
        Self { backend }
    }

    fn backend(&self) -> Result<Arc<dyn SchedulerBackend>> {
        self.backend.upgrade().ok_or(SchedulerError::NotStarted)
    }

    pub fn register_job(&self, definition: JobDefinition) -> Result<()> {
        trigger::validate(&definition)?;
        self.backend()?.register(definition)
    }

    pub fn unregister_job(&self, group: &str, id: &str) -> Result<bool> {
        self.backend()?.unregister(&JobKey::new(group, id))
    }

    pub fn pause(&self, group: &str, id: &str) -> Result<bool> {
        self.backend()?.pause(&JobKey::new(group, id))
    }

    pub fn resume(&self, group: &str, id: &str) -> Result<bool> {
        self.backend()?.resume(&JobKey::new(group, id))
    }

    pub fn trigger_now(&self, group: &str, id: &str) -> Result<bool> {
        self.backend()?.trigger_now(&JobKey::new(group, id))
    }

    pub fn jobs(&self) -> Vec<JobSummary> {
        self.backend().map(|b| b.jobs()).unwrap_or_default()
    }
}
