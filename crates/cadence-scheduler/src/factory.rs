use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::job::Job;
use crate::types::JobDefinition;

/// Turns a job definition into a runnable job.
///
/// Implementations hide how collaborators (data access, messaging, …) are
/// wired into the job; the scheduler only sees the finished [`Job`].
pub trait JobFactory: Send + Sync {
    fn create(&self, definition: &JobDefinition) -> Result<Arc<dyn Job>>;
}

type Constructor = Arc<dyn Fn(&JobDefinition) -> Arc<dyn Job> + Send + Sync>;

/// Explicit registry mapping a job-type id to a constructor.
///
/// Collaborators register their constructors at startup; each constructor
/// captures whatever handles the job needs.
pub struct JobRegistry {
    constructors: RwLock<HashMap<String, Constructor>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            constructors: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the constructor for `job_type`.
    pub fn register<F>(&self, job_type: impl Into<String>, constructor: F)
    where
        F: Fn(&JobDefinition) -> Arc<dyn Job> + Send + Sync + 'static,
    {
        let job_type = job_type.into();
        debug!(%job_type, "job type registered");
        self.constructors
            .write()
            .expect("job registry poisoned")
            .insert(job_type, Arc::new(constructor));
    }

    /// Register one shared instance that serves every firing of `job_type`.
    pub fn register_instance(&self, job_type: impl Into<String>, job: Arc<dyn Job>) {
        self.register(job_type, move |_| Arc::clone(&job));
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .constructors
            .read()
            .expect("job registry poisoned")
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobFactory for JobRegistry {
    fn create(&self, definition: &JobDefinition) -> Result<Arc<dyn Job>> {
        // Clone the Arc out so the constructor runs without holding the lock.
        let constructor = self
            .constructors
            .read()
            .expect("job registry poisoned")
            .get(&definition.job_type)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJobType {
                job_type: definition.job_type.clone(),
            })?;
        Ok(constructor(definition))
    }
}
