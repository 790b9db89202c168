use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use cadence_core::{CadenceConfig, NodeId, SchedulerMode};
use tracing::{debug, info, instrument, warn};

use crate::backend::{SchedulerBackend, SchedulerHandle};
use crate::clustered::ClusteredBackend;
use crate::error::{Result, SchedulerError};
use crate::factory::JobFactory;
use crate::local::LocalBackend;
use crate::store::ClusterStore;
use crate::trigger;
use crate::types::{JobDefinition, JobKey, JobSummary};

/// Scheduler facade. Callers register jobs here without knowing whether the
/// local or the clustered backend runs them.
///
/// Jobs registered before [`start`](Self::start) are validated right away and
/// handed to the backend once it exists.
pub struct SchedulerService {
    factory: Arc<dyn JobFactory>,
    backend: RwLock<Option<Arc<dyn SchedulerBackend>>>,
    pending: Mutex<Vec<JobDefinition>>,
    stopping: AtomicBool,
}

impl SchedulerService {
    pub fn new(factory: Arc<dyn JobFactory>) -> Self {
        Self {
            factory,
            backend: RwLock::new(None),
            pending: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
        }
    }

    /// Select and start the backend for `config.scheduler.mode`.
    ///
    /// A second call is a no-op. Clustered mode fails with
    /// [`SchedulerError::Configuration`] when the store is unreachable.
    #[instrument(skip(self, config), fields(mode = %config.scheduler.mode))]
    pub fn start(&self, config: &CadenceConfig) -> Result<()> {
        if self.is_stopping() {
            return Err(SchedulerError::Configuration(
                "scheduler was shut down and cannot be restarted".into(),
            ));
        }
        let mut slot = self.backend.write().expect("backend slot poisoned");
        if slot.is_some() {
            debug!("scheduler already started");
            return Ok(());
        }

        config.validate()?;
        let backend = self.build_backend(config)?;

        // Deferred jobs go in before the backend is published or started, so
        // a rejected one leaves the service unstarted with nothing lost.
        let mut pending = self.pending.lock().expect("pending jobs poisoned");
        for definition in pending.iter() {
            if let Err(e) = backend.register(definition.clone()) {
                warn!(job = %definition.key, error = %e, code = e.code(), "deferred job rejected; scheduler not started");
                return Err(e);
            }
        }
        let deferred = pending.len();
        pending.clear();
        drop(pending);

        backend.start()?;
        *slot = Some(Arc::clone(&backend));
        drop(slot);

        info!(
            node = %backend.node_id(),
            mode = %backend.mode(),
            workers = config.scheduler.thread_pool_size,
            deferred,
            "scheduler started"
        );
        Ok(())
    }

    fn build_backend(&self, config: &CadenceConfig) -> Result<Arc<dyn SchedulerBackend>> {
        let factory = Arc::clone(&self.factory);
        let scheduler = &config.scheduler;
        let backend: Arc<dyn SchedulerBackend> = match scheduler.mode {
            SchedulerMode::Local => Arc::new_cyclic(|weak: &Weak<LocalBackend>| {
                let target: Weak<dyn SchedulerBackend> = weak.clone();
                LocalBackend::new(scheduler, factory, SchedulerHandle::new(target))
            }),
            SchedulerMode::Clustered => {
                let store = ClusterStore::open(&config.store, scheduler.node_id())?;
                Arc::new_cyclic(|weak: &Weak<ClusteredBackend>| {
                    let target: Weak<dyn SchedulerBackend> = weak.clone();
                    ClusteredBackend::new(scheduler, store, factory, SchedulerHandle::new(target))
                })
            }
        };
        Ok(backend)
    }

    fn backend(&self) -> Option<Arc<dyn SchedulerBackend>> {
        self.backend.read().expect("backend slot poisoned").clone()
    }

    /// Validate and register a job, replacing any job with the same key.
    #[instrument(skip(self, definition), fields(job = %definition.key))]
    pub fn register_job(&self, definition: JobDefinition) -> Result<()> {
        if let Err(e) = trigger::validate(&definition) {
            warn!(error = %e, code = e.code(), "job definition rejected");
            return Err(e);
        }
        if let Some(backend) = self.backend() {
            return backend.register(definition);
        }
        if self.is_stopping() {
            return Err(SchedulerError::NotStarted);
        }

        let mut pending = self.pending.lock().expect("pending jobs poisoned");
        pending.retain(|d| d.key != definition.key);
        pending.push(definition);
        debug!("scheduler not started; registration deferred");
        Ok(())
    }

    /// Remove a job and cancel its trigger. A firing already running is left
    /// to finish. Unknown jobs are ignored.
    #[instrument(skip(self))]
    pub fn unregister_job(&self, group: &str, id: &str) -> Result<()> {
        let key = JobKey::new(group, id);
        let Some(backend) = self.backend() else {
            self.pending
                .lock()
                .expect("pending jobs poisoned")
                .retain(|d| d.key != key);
            return Ok(());
        };
        if !backend.unregister(&key)? {
            debug!(job = %key, "unknown job; nothing to unregister");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn pause(&self, group: &str, id: &str) -> Result<()> {
        let key = JobKey::new(group, id);
        if !self.started()?.pause(&key)? {
            warn!(job = %key, "pause ignored: unknown job");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn resume(&self, group: &str, id: &str) -> Result<()> {
        let key = JobKey::new(group, id);
        if !self.started()?.resume(&key)? {
            warn!(job = %key, "resume ignored: unknown job");
        }
        Ok(())
    }

    /// Fire a job once, outside its schedule. Fires even while paused.
    #[instrument(skip(self))]
    pub fn trigger_now(&self, group: &str, id: &str) -> Result<()> {
        let key = JobKey::new(group, id);
        if !self.started()?.trigger_now(&key)? {
            warn!(job = %key, "trigger ignored: unknown job");
        }
        Ok(())
    }

    fn started(&self) -> Result<Arc<dyn SchedulerBackend>> {
        self.backend().ok_or(SchedulerError::NotStarted)
    }

    /// Stop firing, drop queued firings, and wait up to `timeout` for running
    /// ones. Anything still running after that is cancelled and reported as
    /// [`SchedulerError::ShutdownIncomplete`].
    #[instrument(skip(self))]
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        let backend = self.backend.write().expect("backend slot poisoned").take();
        let Some(backend) = backend else {
            return Ok(());
        };

        info!(node = %backend.node_id(), "scheduler shutting down");
        let result = backend.shutdown(timeout).await;
        match &result {
            Ok(()) => info!("scheduler stopped cleanly"),
            Err(e) => warn!(error = %e, code = e.code(), "scheduler stopped"),
        }
        result
    }

    /// Registered jobs with their trigger state. Empty until started.
    pub fn jobs(&self) -> Vec<JobSummary> {
        self.backend().map(|b| b.jobs()).unwrap_or_default()
    }

    pub fn is_started(&self) -> bool {
        self.backend().is_some()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> Option<SchedulerMode> {
        self.backend().map(|b| b.mode())
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.backend().map(|b| b.node_id().clone())
    }

    /// Handle for code outside job bodies that needs to manage jobs.
    pub fn handle(&self) -> Option<SchedulerHandle> {
        self.backend().map(|b| SchedulerHandle::new(Arc::downgrade(&b)))
    }
}
