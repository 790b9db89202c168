use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::{NodeId, SchedulerConfig, SchedulerMode};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{SchedulerBackend, SchedulerHandle};
use crate::error::{Result, SchedulerError};
use crate::factory::JobFactory;
use crate::local::LocalBackend;
use crate::pool::{FireListener, FireOutcome, FireRequest, Firing, WorkerPool};
use crate::store::{from_ms, to_ms, ClaimKind, ClusterStore, TriggerRow};
use crate::trigger;
use crate::types::{FireStatus, JobDefinition, JobKey, JobSummary, TriggerSource, TriggerState};

/// This node's view of a cluster-aware job it registered.
struct ClusterJob {
    definition: Arc<JobDefinition>,
    queued: u32,
    in_flight: u32,
    fire_count: u64,
    failure_count: u64,
    last_fired_at: Option<DateTime<Utc>>,
    last_status: Option<FireStatus>,
}

impl ClusterJob {
    fn new(definition: Arc<JobDefinition>) -> Self {
        Self {
            definition,
            queued: 0,
            in_flight: 0,
            fire_count: 0,
            failure_count: 0,
            last_fired_at: None,
            last_status: None,
        }
    }

    fn busy(&self) -> bool {
        self.queued > 0 || self.in_flight > 0
    }
}

struct ClusterShared {
    store: Arc<ClusterStore>,
    node_id: NodeId,
    jobs: Mutex<HashMap<JobKey, ClusterJob>>,
    /// Heartbeat stop tokens of the claims this node currently holds.
    leases: DashMap<(JobKey, String), CancellationToken>,
    lease: Duration,
    misfire_threshold: chrono::Duration,
    tick: Duration,
    wake: Notify,
    stop: CancellationToken,
    enabled: bool,
}

/// Clustered backend: one logical schedule shared through [`ClusterStore`].
///
/// Every node scans the shared trigger table and races to claim due
/// firings; the claim transaction lets exactly one win. Jobs registered
/// with `cluster_aware = false` bypass the store and run on the embedded
/// local backend, sharing this node's worker pool.
pub struct ClusteredBackend {
    shared: Arc<ClusterShared>,
    local: LocalBackend,
    pool: WorkerPool,
    queue_capacity: usize,
    started: AtomicBool,
}

impl ClusteredBackend {
    pub(crate) fn new(
        config: &SchedulerConfig,
        store: ClusterStore,
        factory: Arc<dyn JobFactory>,
        handle: SchedulerHandle,
    ) -> Self {
        let node_id = store.node_id().clone();
        let pool = WorkerPool::new(config, factory, handle, node_id.clone());
        let local = LocalBackend::embedded(config, pool.clone(), node_id.clone());
        Self {
            shared: Arc::new(ClusterShared {
                store: Arc::new(store),
                node_id,
                jobs: Mutex::new(HashMap::new()),
                leases: DashMap::new(),
                lease: Duration::from_millis(config.lease_duration_ms),
                misfire_threshold: trigger::millis(config.misfire_threshold_ms),
                tick: Duration::from_millis(config.tick_interval_ms),
                wake: Notify::new(),
                stop: CancellationToken::new(),
                enabled: config.enabled,
            }),
            local,
            pool,
            queue_capacity: config.queue_capacity,
            started: AtomicBool::new(false),
        }
    }

    fn is_local(&self, key: &JobKey) -> bool {
        self.local.contains(key)
    }

    fn summary(&self, key: &JobKey, job: &ClusterJob) -> JobSummary {
        let row = match self.shared.store.trigger_row(key) {
            Ok(row) => row,
            Err(e) => {
                warn!(job = %key, error = %e, "cannot read trigger row");
                None
            }
        };
        let state = match &row {
            Some(r) if r.paused => TriggerState::Paused,
            _ if job.in_flight > 0 => TriggerState::Firing,
            _ if job.queued > 0 => TriggerState::Due,
            Some(TriggerRow { next_fire_ms: Some(_), .. }) => TriggerState::Scheduled,
            _ => TriggerState::Dormant,
        };
        JobSummary {
            key: key.clone(),
            job_type: job.definition.job_type.clone(),
            trigger: job.definition.trigger.clone(),
            state,
            next_fire_time: row.and_then(|r| r.next_fire_ms).map(from_ms),
            last_fired_at: job.last_fired_at,
            last_status: job.last_status.clone(),
            fire_count: job.fire_count,
            failure_count: job.failure_count,
            cluster_aware: true,
        }
    }
}

impl ClusterShared {
    async fn run_clock(self: Arc<Self>, pool: WorkerPool) {
        info!(node = %self.node_id, lease_ms = self.lease.as_millis() as u64, "cluster scheduler clock started");
        loop {
            if self.enabled {
                if let Err(e) = self.tick_once(&pool) {
                    error!(node = %self.node_id, error = %e, code = e.code(), "cluster tick failed");
                }
            }
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.tick) => {}
            }
        }
        info!(node = %self.node_id, "cluster scheduler clock stopped");
    }

    /// Reconcile with the store, recover expired claims, then claim due
    /// firings.
    fn tick_once(self: &Arc<Self>, pool: &WorkerPool) -> Result<()> {
        self.reconcile()?;
        let now = Utc::now();
        let now_ms = to_ms(now);
        let lease_ms = self.lease.as_millis() as i64;

        self.store.purge_orphaned_claims(now_ms)?;
        for record in self.store.expired_claims(now_ms)? {
            let Some(definition) = self.idle_definition(&record.key) else {
                continue;
            };
            if !self.store.reclaim(&record, definition.concurrent, now_ms, lease_ms)? {
                continue;
            }
            warn!(
                job = %record.key,
                fire_instance = %record.fire_instance_id,
                previous_owner = %record.acquired_by,
                "recovering firing whose lease expired"
            );
            let scheduled_for = instance_time(&record.fire_instance_id).map_or(now, from_ms);
            self.dispatch(pool, definition, record.fire_instance_id, scheduled_for, TriggerSource::Recovery);
        }

        for row in self.store.due_triggers(now_ms)? {
            let Some(definition) = self.idle_definition(&row.key) else {
                continue;
            };
            let (kind, source, scheduled_ms) = match (row.fire_now_ms, row.next_fire_ms) {
                (Some(requested_ms), _) => (ClaimKind::Manual { requested_ms }, TriggerSource::Manual, requested_ms),
                (None, Some(due_ms)) if !row.paused && due_ms <= now_ms => {
                    let (anchor, _) = trigger::cadence_anchor(from_ms(due_ms), now, self.misfire_threshold);
                    let next_ms = trigger::next_after(&definition.trigger, anchor).map(to_ms);
                    (ClaimKind::Scheduled { due_ms, next_ms }, TriggerSource::Schedule, due_ms)
                }
                _ => continue,
            };

            match self.store.claim(&row.key, kind, definition.concurrent, now_ms, lease_ms) {
                Ok(record) => {
                    debug!(job = %row.key, fire_instance = %record.fire_instance_id, node = %self.node_id, "claim won");
                    self.dispatch(pool, definition, record.fire_instance_id, from_ms(scheduled_ms), source);
                }
                Err(SchedulerError::ClaimConflict { key, fire_instance_id }) => {
                    debug!(job = %key, fire_instance = %fire_instance_id, "claim lost to another node");
                }
                Err(e) => {
                    error!(job = %row.key, error = %e, code = e.code(), "claim failed");
                }
            }
        }
        Ok(())
    }

    /// Adopt definitions another node replaced and drop local copies of
    /// jobs another node unregistered.
    fn reconcile(&self) -> Result<()> {
        let mut stored = self.store.definitions()?;
        let mut jobs = self.jobs.lock().expect("cluster jobs poisoned");
        jobs.retain(|key, job| match stored.remove(key) {
            Some(definition) => {
                if *job.definition != definition {
                    info!(job = %key, "definition replaced by another node; adopting it");
                    job.definition = Arc::new(definition);
                }
                true
            }
            None => {
                let keep = job.busy();
                if !keep {
                    info!(job = %key, "job removed from the cluster; dropping local copy");
                }
                keep
            }
        });
        Ok(())
    }

    /// Definition of a known job that has no firing waiting in the queue.
    /// Non-concurrent jobs must also have nothing running on this node.
    fn idle_definition(&self, key: &JobKey) -> Option<Arc<JobDefinition>> {
        let jobs = self.jobs.lock().expect("cluster jobs poisoned");
        let job = jobs.get(key)?;
        if job.queued > 0 || (job.in_flight > 0 && !job.definition.concurrent) {
            return None;
        }
        Some(Arc::clone(&job.definition))
    }

    fn dispatch(
        self: &Arc<Self>,
        pool: &WorkerPool,
        definition: Arc<JobDefinition>,
        fire_instance_id: String,
        scheduled_for: DateTime<Utc>,
        source: TriggerSource,
    ) {
        let key = definition.key.clone();
        if let Some(job) = self.jobs.lock().expect("cluster jobs poisoned").get_mut(&key) {
            job.queued += 1;
        }

        let stop = CancellationToken::new();
        self.leases.insert((key.clone(), fire_instance_id.clone()), stop.clone());
        tokio::spawn(heartbeat(
            Arc::clone(&self.store),
            key.clone(),
            fire_instance_id.clone(),
            self.lease,
            stop,
        ));

        let request = FireRequest {
            firing: Firing {
                definition,
                fire_instance_id,
                scheduled_for,
                source,
                generation: 0,
            },
            listener: Arc::clone(self) as Arc<dyn FireListener>,
        };
        if let Err(rejected) = pool.submit(request) {
            let id = rejected.firing.fire_instance_id;
            if let Some(job) = self.jobs.lock().expect("cluster jobs poisoned").get_mut(&key) {
                job.queued = job.queued.saturating_sub(1);
            }
            self.stop_heartbeat(&key, &id);
            if let Err(e) = self.store.release(&key, &id) {
                error!(job = %key, fire_instance = %id, error = %e, "cannot release claim");
            }
            if pool.is_closed() {
                debug!(job = %key, fire_instance = %id, "pool closed; claim released");
            } else {
                error!(job = %key, fire_instance = %id, "due queue full; claim released for another node");
            }
        }
    }

    fn stop_heartbeat(&self, key: &JobKey, fire_instance_id: &str) {
        if let Some((_, stop)) = self.leases.remove(&(key.clone(), fire_instance_id.to_string())) {
            stop.cancel();
        }
    }

    fn finish_in_store(&self, firing: &Firing, outcome: &FireOutcome) -> Result<()> {
        let key = firing.key();
        let id = &firing.fire_instance_id;
        if matches!(outcome.status, FireStatus::Abandoned | FireStatus::Cancelled) {
            // let a peer pick it up right away
            self.store.release(key, id)?;
            return Ok(());
        }

        let misfire = (firing.source == TriggerSource::Schedule && !firing.definition.concurrent).then(|| {
            (to_ms(outcome.finished_at), self.misfire_threshold.num_milliseconds())
        });
        if self.store.complete_firing(key, id, misfire)? {
            warn!(
                job = %key,
                fire_instance = %id,
                "misfire: next slot already missed, firing once immediately"
            );
        }

        if !firing.definition.durable && self.store.remove_if_exhausted(key)? {
            let mut jobs = self.jobs.lock().expect("cluster jobs poisoned");
            if jobs.get(key).is_some_and(|j| !j.busy()) {
                jobs.remove(key);
            }
            info!(job = %key, "trigger exhausted; job removed");
        }
        Ok(())
    }
}

impl FireListener for ClusterShared {
    fn on_start(&self, firing: &Firing) {
        let mut jobs = self.jobs.lock().expect("cluster jobs poisoned");
        if let Some(job) = jobs.get_mut(firing.key()) {
            job.queued = job.queued.saturating_sub(1);
            job.in_flight += 1;
        }
    }

    fn on_complete(&self, firing: &Firing, outcome: &FireOutcome) {
        self.stop_heartbeat(firing.key(), &firing.fire_instance_id);
        {
            let mut jobs = self.jobs.lock().expect("cluster jobs poisoned");
            if let Some(job) = jobs.get_mut(firing.key()) {
                if outcome.status == FireStatus::Abandoned {
                    job.queued = job.queued.saturating_sub(1);
                } else {
                    job.in_flight = job.in_flight.saturating_sub(1);
                    job.fire_count += 1;
                    if matches!(outcome.status, FireStatus::Failed { .. }) {
                        job.failure_count += 1;
                    }
                    job.last_fired_at = outcome.started_at;
                    job.last_status = Some(outcome.status.clone());
                }
            }
        }

        if let Err(e) = self.finish_in_store(firing, outcome) {
            error!(
                job = %firing.key(),
                fire_instance = %firing.fire_instance_id,
                error = %e,
                code = e.code(),
                "cannot record firing completion; the claim will expire and be recovered"
            );
        }
        self.wake.notify_one();
    }
}

/// Renew one claim every `lease / 3` until stopped or the claim is lost.
async fn heartbeat(
    store: Arc<ClusterStore>,
    key: JobKey,
    fire_instance_id: String,
    lease: Duration,
    stop: CancellationToken,
) {
    let period = lease / 3;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }
        let expires_ms = to_ms(Utc::now()) + lease.as_millis() as i64;
        match store.renew(&key, &fire_instance_id, expires_ms) {
            Ok(true) => debug!(job = %key, fire_instance = %fire_instance_id, "lease renewed"),
            Ok(false) => {
                warn!(job = %key, fire_instance = %fire_instance_id, "lease lost; another node may re-fire");
                return;
            }
            Err(e) => warn!(job = %key, fire_instance = %fire_instance_id, error = %e, "lease renewal failed"),
        }
    }
}

/// Slot time encoded in a fire instance id.
fn instance_time(fire_instance_id: &str) -> Option<i64> {
    fire_instance_id
        .strip_prefix("manual-")
        .unwrap_or(fire_instance_id)
        .parse()
        .ok()
}

#[async_trait]
impl SchedulerBackend for ClusteredBackend {
    fn mode(&self) -> SchedulerMode {
        SchedulerMode::Clustered
    }

    fn node_id(&self) -> &NodeId {
        &self.shared.node_id
    }

    fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pool.start();
        self.local.start_clock();
        let shared = Arc::clone(&self.shared);
        let pool = self.pool.clone();
        tokio::spawn(async move { shared.run_clock(pool).await });
        if !self.shared.enabled {
            warn!("scheduling disabled by configuration; this node will not claim firings");
        }
        Ok(())
    }

    fn register(&self, definition: JobDefinition) -> Result<()> {
        let key = definition.key.clone();
        let known = self.is_local(&key)
            || self.shared.jobs.lock().expect("cluster jobs poisoned").contains_key(&key);
        let registered =
            self.local.len() + self.shared.jobs.lock().expect("cluster jobs poisoned").len();
        if !known && registered >= self.queue_capacity {
            return Err(SchedulerError::Configuration(format!(
                "cannot register {key}: due queue capacity {} exhausted; raise scheduler.queue_capacity",
                self.queue_capacity
            )));
        }

        if !definition.cluster_aware {
            if self.shared.jobs.lock().expect("cluster jobs poisoned").remove(&key).is_some() {
                self.shared.store.delete_definition(&key)?;
            }
            return self.local.register(definition);
        }
        if self.is_local(&key) {
            self.local.unregister(&key)?;
        }

        let now = Utc::now();
        let first_fire = trigger::first_fire(&definition.trigger, now).map(to_ms);
        let reset = self.shared.store.upsert_definition(&definition, first_fire, to_ms(now))?;

        let definition = Arc::new(definition);
        let mut jobs = self.shared.jobs.lock().expect("cluster jobs poisoned");
        match jobs.get_mut(&key) {
            Some(job) => job.definition = definition,
            None => {
                jobs.insert(key.clone(), ClusterJob::new(definition));
            }
        }
        drop(jobs);

        info!(job = %key, node = %self.shared.node_id, schedule_reset = reset, "clustered job registered");
        self.shared.wake.notify_one();
        Ok(())
    }

    fn unregister(&self, key: &JobKey) -> Result<bool> {
        if self.is_local(key) {
            return self.local.unregister(key);
        }
        let known = self.shared.jobs.lock().expect("cluster jobs poisoned").remove(key).is_some();
        let stored = self.shared.store.delete_definition(key)?;
        if known || stored {
            info!(job = %key, node = %self.shared.node_id, "clustered job unregistered");
        }
        Ok(known || stored)
    }

    fn pause(&self, key: &JobKey) -> Result<bool> {
        if self.is_local(key) {
            return self.local.pause(key);
        }
        let found = self.shared.store.set_paused(key, true, to_ms(Utc::now()))?;
        if found {
            info!(job = %key, "clustered job paused");
        }
        Ok(found)
    }

    fn resume(&self, key: &JobKey) -> Result<bool> {
        if self.is_local(key) {
            return self.local.resume(key);
        }
        let found = self.shared.store.set_paused(key, false, to_ms(Utc::now()))?;
        if found {
            info!(job = %key, "clustered job resumed");
            self.shared.wake.notify_one();
        }
        Ok(found)
    }

    fn trigger_now(&self, key: &JobKey) -> Result<bool> {
        if self.is_local(key) {
            return self.local.trigger_now(key);
        }
        let found = self.shared.store.request_fire_now(key, to_ms(Utc::now()))?;
        if found {
            info!(job = %key, "manual firing requested");
            self.shared.wake.notify_one();
        }
        Ok(found)
    }

    fn jobs(&self) -> Vec<JobSummary> {
        let mut summaries = self.local.jobs();
        {
            let jobs = self.shared.jobs.lock().expect("cluster jobs poisoned");
            summaries.extend(jobs.iter().map(|(key, job)| self.summary(key, job)));
        }
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }

    async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.shared.stop.cancel();
        self.local.stop_clock();

        let cancelled = self.pool.shutdown(timeout).await;

        for entry in self.shared.leases.iter() {
            entry.value().cancel();
        }
        self.shared.leases.clear();
        self.shared.store.release_node_claims()?;

        info!(node = %self.shared.node_id, cancelled, "clustered scheduler stopped");
        if cancelled > 0 {
            return Err(SchedulerError::ShutdownIncomplete { cancelled });
        }
        Ok(())
    }
}
