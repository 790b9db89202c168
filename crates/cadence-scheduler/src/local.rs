use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::{NodeId, SchedulerConfig, SchedulerMode};
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{SchedulerBackend, SchedulerHandle};
use crate::error::{Result, SchedulerError};
use crate::factory::JobFactory;
use crate::pool::{FireListener, FireOutcome, FireRequest, Firing, WorkerPool};
use crate::trigger;
use crate::types::{FireStatus, JobDefinition, JobKey, JobSummary, TriggerSource, TriggerState};

/// In-memory trigger for one registered job.
struct TriggerEntry {
    definition: Arc<JobDefinition>,
    /// Bumped on every re-registration; completions of older generations
    /// must not move the new trigger.
    generation: u64,
    /// Generation the entry was created with. Firings older than this
    /// belong to an unregistered predecessor and do not count in its stats.
    created: u64,
    next_fire: Option<DateTime<Utc>>,
    paused: bool,
    /// A firing sits in the due queue.
    queued: bool,
    in_flight: u32,
    fire_now: bool,
    fire_count: u64,
    failure_count: u64,
    last_fired_at: Option<DateTime<Utc>>,
    last_status: Option<FireStatus>,
}

impl TriggerEntry {
    fn state(&self) -> TriggerState {
        if self.paused {
            TriggerState::Paused
        } else if self.in_flight > 0 {
            TriggerState::Firing
        } else if self.queued {
            TriggerState::Due
        } else if self.next_fire.is_none() {
            TriggerState::Dormant
        } else {
            TriggerState::Scheduled
        }
    }

    /// Overlap rule: non-concurrent jobs wait for their previous firing.
    fn blocked(&self) -> bool {
        self.queued || (self.in_flight > 0 && !self.definition.concurrent)
    }

    fn summary(&self) -> JobSummary {
        JobSummary {
            key: self.definition.key.clone(),
            job_type: self.definition.job_type.clone(),
            trigger: self.definition.trigger.clone(),
            state: self.state(),
            next_fire_time: self.next_fire,
            last_fired_at: self.last_fired_at,
            last_status: self.last_status.clone(),
            fire_count: self.fire_count,
            failure_count: self.failure_count,
            cluster_aware: self.definition.cluster_aware,
        }
    }
}

#[derive(Default)]
struct TriggerSet {
    entries: HashMap<JobKey, TriggerEntry>,
    /// Running firings of unregistered jobs. A job registered again under
    /// the same key inherits the count, so the overlap rule still holds.
    retired: HashMap<JobKey, u32>,
}

struct LocalShared {
    triggers: Mutex<TriggerSet>,
    /// Wakes the clock early after a registration or manual trigger.
    wake: Notify,
    stop: CancellationToken,
    next_generation: AtomicU64,
    misfire_threshold: chrono::Duration,
    tick: Duration,
    queue_capacity: usize,
    enabled: bool,
}

/// Single-process backend: in-memory triggers, one clock task, worker pool.
///
/// Also embedded in the clustered backend, where it fires the
/// `cluster_aware = false` jobs on every node.
pub struct LocalBackend {
    shared: Arc<LocalShared>,
    pool: WorkerPool,
    /// False when embedded; the owner then starts and drains the pool.
    owns_pool: bool,
    node_id: NodeId,
    started: AtomicBool,
}

impl LocalBackend {
    pub(crate) fn new(
        config: &SchedulerConfig,
        factory: Arc<dyn JobFactory>,
        handle: SchedulerHandle,
    ) -> Self {
        let node_id = config.node_id();
        let pool = WorkerPool::new(config, factory, handle, node_id.clone());
        Self::build(config, pool, true, node_id)
    }

    /// Local backend driving a pool owned by someone else.
    pub(crate) fn embedded(config: &SchedulerConfig, pool: WorkerPool, node_id: NodeId) -> Self {
        Self::build(config, pool, false, node_id)
    }

    fn build(config: &SchedulerConfig, pool: WorkerPool, owns_pool: bool, node_id: NodeId) -> Self {
        Self {
            shared: Arc::new(LocalShared {
                triggers: Mutex::new(TriggerSet::default()),
                wake: Notify::new(),
                stop: CancellationToken::new(),
                next_generation: AtomicU64::new(1),
                misfire_threshold: trigger::millis(config.misfire_threshold_ms),
                tick: Duration::from_millis(config.tick_interval_ms),
                queue_capacity: config.queue_capacity,
                enabled: config.enabled,
            }),
            pool,
            owns_pool,
            node_id,
            started: AtomicBool::new(false),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.shared.triggers.lock().expect("trigger set poisoned").entries.len()
    }

    pub(crate) fn contains(&self, key: &JobKey) -> bool {
        self.shared
            .triggers
            .lock()
            .expect("trigger set poisoned")
            .entries
            .contains_key(key)
    }

    /// Spawn the clock task only.
    pub(crate) fn start_clock(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let pool = self.pool.clone();
        tokio::spawn(async move { shared.run_clock(pool).await });
    }

    pub(crate) fn stop_clock(&self) {
        self.shared.stop.cancel();
    }
}

impl LocalShared {
    async fn run_clock(self: Arc<Self>, pool: WorkerPool) {
        info!(tick_ms = self.tick.as_millis() as u64, "local scheduler clock started");
        if !self.enabled {
            warn!("scheduling disabled by configuration; registered jobs will not fire");
        }
        loop {
            let sleep_for = if self.enabled { self.scan(&pool) } else { self.tick };
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        info!("local scheduler clock stopped");
    }

    /// Promote every due trigger and hand it to the pool, earliest first.
    ///
    /// Returns how long the clock may sleep before the next trigger is due.
    fn scan(self: &Arc<Self>, pool: &WorkerPool) -> Duration {
        let now = Utc::now();
        let mut set = self.triggers.lock().expect("trigger set poisoned");
        let triggers = &mut set.entries;

        let mut due: Vec<(DateTime<Utc>, JobKey, TriggerSource)> = triggers
            .iter()
            .filter_map(|(key, entry)| {
                if entry.blocked() {
                    return None;
                }
                if entry.fire_now {
                    return Some((now, key.clone(), TriggerSource::Manual));
                }
                if entry.paused {
                    return None;
                }
                match entry.next_fire {
                    Some(at) if at <= now => Some((at, key.clone(), TriggerSource::Schedule)),
                    _ => None,
                }
            })
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0));

        for (scheduled_for, key, source) in due {
            let Some(entry) = triggers.get_mut(&key) else {
                continue;
            };
            entry.queued = true;
            if source == TriggerSource::Manual {
                entry.fire_now = false;
            } else if entry.definition.concurrent {
                // Concurrent jobs advance at promotion; the next slot may
                // fire while this one is still running.
                let (anchor, _) = trigger::cadence_anchor(scheduled_for, now, self.misfire_threshold);
                entry.next_fire = trigger::next_after(&entry.definition.trigger, anchor);
            }

            let fire_instance_id = match source {
                TriggerSource::Manual => format!("manual-{}", now.timestamp_millis()),
                _ => scheduled_for.timestamp_millis().to_string(),
            };
            let request = FireRequest {
                firing: Firing {
                    definition: Arc::clone(&entry.definition),
                    fire_instance_id,
                    scheduled_for,
                    source,
                    generation: entry.generation,
                },
                listener: Arc::clone(self) as Arc<dyn FireListener>,
            };
            if let Err(rejected) = pool.submit(request) {
                entry.queued = false;
                if source == TriggerSource::Manual {
                    entry.fire_now = true;
                }
                if pool.is_closed() {
                    debug!(job = %key, "pool closed; firing not queued");
                } else {
                    error!(
                        job = %key,
                        fire_instance = %rejected.firing.fire_instance_id,
                        "due queue full; firing retried on next tick"
                    );
                }
            }
        }

        let earliest = triggers
            .values()
            .filter(|e| !e.paused && !e.blocked())
            .filter_map(|e| e.next_fire)
            .min();
        match earliest {
            Some(at) if at > now => (at - now).to_std().unwrap_or(self.tick).min(self.tick),
            _ => self.tick,
        }
    }
}

impl FireListener for LocalShared {
    fn on_start(&self, firing: &Firing) {
        let mut set = self.triggers.lock().expect("trigger set poisoned");
        match set.entries.get_mut(firing.key()) {
            Some(entry) => {
                if firing.generation >= entry.created {
                    entry.queued = false;
                }
                entry.in_flight += 1;
            }
            // unregistered while queued; it still occupies the key
            None => *set.retired.entry(firing.key().clone()).or_insert(0) += 1,
        }
    }

    fn on_complete(&self, firing: &Firing, outcome: &FireOutcome) {
        let mut set = self.triggers.lock().expect("trigger set poisoned");
        let key = firing.key();
        let Some(entry) = set.entries.get_mut(key) else {
            if outcome.status != FireStatus::Abandoned {
                release_retired(&mut set.retired, key);
            }
            return;
        };

        let current = firing.generation >= entry.created;
        if outcome.status == FireStatus::Abandoned {
            if current {
                entry.queued = false;
            }
            return;
        }
        entry.in_flight = entry.in_flight.saturating_sub(1);
        if current {
            entry.fire_count += 1;
            if matches!(outcome.status, FireStatus::Failed { .. }) {
                entry.failure_count += 1;
            }
            entry.last_fired_at = outcome.started_at;
            entry.last_status = Some(outcome.status.clone());
        }

        let same_generation = entry.generation == firing.generation;
        if same_generation && firing.source == TriggerSource::Schedule && !entry.definition.concurrent {
            let now = Utc::now();
            match trigger::advance(&entry.definition.trigger, outcome.anchor, now, self.misfire_threshold) {
                Some(adv) => {
                    if adv.misfired {
                        warn!(
                            job = %key,
                            fire_instance = %firing.fire_instance_id,
                            "misfire: next slot already missed, firing once immediately"
                        );
                    }
                    entry.next_fire = Some(adv.next);
                }
                None => entry.next_fire = None,
            }
        }

        let exhausted =
            entry.next_fire.is_none() && entry.in_flight == 0 && !entry.queued && !entry.fire_now;
        if exhausted {
            if entry.definition.durable {
                debug!(job = %key, "trigger exhausted; durable job kept dormant");
            } else {
                set.entries.remove(key);
                info!(job = %key, "trigger exhausted; job removed");
            }
        }
        drop(set);
        self.wake.notify_one();
    }
}

fn release_retired(retired: &mut HashMap<JobKey, u32>, key: &JobKey) {
    if let Some(n) = retired.get_mut(key) {
        *n = n.saturating_sub(1);
        if *n == 0 {
            retired.remove(key);
        }
    }
}

#[async_trait]
impl SchedulerBackend for LocalBackend {
    fn mode(&self) -> SchedulerMode {
        SchedulerMode::Local
    }

    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn start(&self) -> Result<()> {
        if self.owns_pool {
            self.pool.start();
        }
        self.start_clock();
        Ok(())
    }

    fn register(&self, definition: JobDefinition) -> Result<()> {
        let key = definition.key.clone();
        let next_fire = trigger::first_fire(&definition.trigger, Utc::now());
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let definition = Arc::new(definition);

        let mut set = self.shared.triggers.lock().expect("trigger set poisoned");
        if !set.entries.contains_key(&key) && set.entries.len() >= self.shared.queue_capacity {
            return Err(SchedulerError::Configuration(format!(
                "cannot register {key}: due queue capacity {} exhausted; raise scheduler.queue_capacity",
                self.shared.queue_capacity
            )));
        }

        let inherited = set.retired.remove(&key).unwrap_or(0);
        let replaced = match set.entries.get_mut(&key) {
            Some(entry) => {
                entry.definition = definition;
                entry.generation = generation;
                entry.next_fire = next_fire;
                entry.fire_now = false;
                true
            }
            None => {
                set.entries.insert(
                    key.clone(),
                    TriggerEntry {
                        definition,
                        generation,
                        created: generation,
                        next_fire,
                        paused: false,
                        queued: false,
                        in_flight: inherited,
                        fire_now: false,
                        fire_count: 0,
                        failure_count: 0,
                        last_fired_at: None,
                        last_status: None,
                    },
                );
                false
            }
        };
        drop(set);

        info!(job = %key, next_fire = ?next_fire, replaced, inherited, "job registered");
        self.shared.wake.notify_one();
        Ok(())
    }

    fn unregister(&self, key: &JobKey) -> Result<bool> {
        let mut set = self.shared.triggers.lock().expect("trigger set poisoned");
        let Some(entry) = set.entries.remove(key) else {
            return Ok(false);
        };
        if entry.in_flight > 0 {
            set.retired.insert(key.clone(), entry.in_flight);
        }
        drop(set);
        info!(job = %key, in_flight = entry.in_flight, "job unregistered");
        Ok(true)
    }

    fn pause(&self, key: &JobKey) -> Result<bool> {
        let mut set = self.shared.triggers.lock().expect("trigger set poisoned");
        let Some(entry) = set.entries.get_mut(key) else {
            return Ok(false);
        };
        entry.paused = true;
        info!(job = %key, "job paused");
        Ok(true)
    }

    fn resume(&self, key: &JobKey) -> Result<bool> {
        let mut set = self.shared.triggers.lock().expect("trigger set poisoned");
        let Some(entry) = set.entries.get_mut(key) else {
            return Ok(false);
        };
        entry.paused = false;
        drop(set);
        info!(job = %key, "job resumed");
        self.shared.wake.notify_one();
        Ok(true)
    }

    fn trigger_now(&self, key: &JobKey) -> Result<bool> {
        let mut set = self.shared.triggers.lock().expect("trigger set poisoned");
        let Some(entry) = set.entries.get_mut(key) else {
            return Ok(false);
        };
        entry.fire_now = true;
        drop(set);
        info!(job = %key, "manual firing requested");
        self.shared.wake.notify_one();
        Ok(true)
    }

    fn jobs(&self) -> Vec<JobSummary> {
        let set = self.shared.triggers.lock().expect("trigger set poisoned");
        let mut jobs: Vec<JobSummary> = set.entries.values().map(TriggerEntry::summary).collect();
        jobs.sort_by(|a, b| a.key.cmp(&b.key));
        jobs
    }

    async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.stop_clock();
        if !self.owns_pool {
            return Ok(());
        }
        let cancelled = self.pool.shutdown(timeout).await;
        if cancelled > 0 {
            return Err(SchedulerError::ShutdownIncomplete { cancelled });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::JobRegistry;
    use crate::job::{Job, JobError, JobExecutionContext};
    use crate::types::TriggerSpec;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Weak;

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl Job for Counter {
        async fn execute(&self, _ctx: &JobExecutionContext) -> std::result::Result<(), JobError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Sleeps and records the highest number of copies seen running at once.
    #[derive(Default)]
    struct Overlap {
        running: AtomicUsize,
        max_running: AtomicUsize,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Job for Overlap {
        async fn execute(&self, _ctx: &JobExecutionContext) -> std::result::Result<(), JobError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn backend(registry: JobRegistry, config: SchedulerConfig) -> Arc<LocalBackend> {
        let factory: Arc<dyn JobFactory> = Arc::new(registry);
        Arc::new_cyclic(|weak: &Weak<LocalBackend>| {
            let target: Weak<dyn SchedulerBackend> = weak.clone();
            LocalBackend::new(&config, factory, SchedulerHandle::new(target))
        })
    }

    fn every(ms: u64) -> TriggerSpec {
        TriggerSpec::every(Duration::from_millis(ms))
    }

    #[tokio::test]
    async fn reregistration_replaces_trigger() {
        let local = backend(JobRegistry::new(), SchedulerConfig::default());
        local.register(JobDefinition::new("g", "a", "count", every(60_000))).unwrap();
        local.register(JobDefinition::new("g", "a", "count", every(30_000))).unwrap();

        let jobs = local.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].trigger, every(30_000));
    }

    #[tokio::test]
    async fn queue_capacity_caps_registrations() {
        let config = SchedulerConfig {
            queue_capacity: 1,
            ..SchedulerConfig::default()
        };
        let local = backend(JobRegistry::new(), config);
        local.register(JobDefinition::new("g", "a", "count", every(1_000))).unwrap();
        let err = local
            .register(JobDefinition::new("g", "b", "count", every(1_000)))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));
        // replacing an existing key still works
        local.register(JobDefinition::new("g", "a", "count", every(2_000))).unwrap();
    }

    #[tokio::test]
    async fn unregister_unknown_is_noop() {
        let local = backend(JobRegistry::new(), SchedulerConfig::default());
        assert!(!local.unregister(&JobKey::new("g", "missing")).unwrap());
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_state() {
        let local = backend(JobRegistry::new(), SchedulerConfig::default());
        local.register(JobDefinition::new("g", "a", "count", every(60_000))).unwrap();
        let key = JobKey::new("g", "a");

        assert!(local.pause(&key).unwrap());
        assert_eq!(local.jobs()[0].state, TriggerState::Paused);
        assert!(local.resume(&key).unwrap());
        assert_eq!(local.jobs()[0].state, TriggerState::Scheduled);
        assert!(!local.pause(&JobKey::new("g", "missing")).unwrap());
    }

    #[tokio::test]
    async fn paused_job_does_not_fire() {
        let count = Arc::new(AtomicUsize::new(0));
        let registry = JobRegistry::new();
        registry.register_instance("count", Arc::new(Counter(Arc::clone(&count))));
        let local = backend(registry, SchedulerConfig::default());
        local.start().unwrap();

        local.register(JobDefinition::new("g", "a", "count", every(50))).unwrap();
        local.pause(&JobKey::new("g", "a")).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        local.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn trigger_now_fires_out_of_schedule() {
        let count = Arc::new(AtomicUsize::new(0));
        let registry = JobRegistry::new();
        registry.register_instance("count", Arc::new(Counter(Arc::clone(&count))));
        let local = backend(registry, SchedulerConfig::default());
        local.start().unwrap();

        local.register(JobDefinition::new("g", "a", "count", every(3_600_000))).unwrap();
        assert!(local.trigger_now(&JobKey::new("g", "a")).unwrap());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // the regular hourly slot is untouched
        let next = local.jobs()[0].next_fire_time.unwrap();
        assert!(next > Utc::now() + chrono::Duration::minutes(59));

        local.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn once_trigger_removes_non_durable_and_keeps_durable() {
        let count = Arc::new(AtomicUsize::new(0));
        let registry = JobRegistry::new();
        registry.register_instance("count", Arc::new(Counter(Arc::clone(&count))));
        let local = backend(registry, SchedulerConfig::default());
        local.start().unwrap();

        let at = Utc::now() + chrono::Duration::milliseconds(50);
        local
            .register(JobDefinition::new("g", "oneshot", "count", TriggerSpec::once(at)))
            .unwrap();
        local
            .register(JobDefinition::new("g", "kept", "count", TriggerSpec::once(at)).durable(true))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        let jobs = local.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].key, JobKey::new("g", "kept"));
        assert_eq!(jobs[0].state, TriggerState::Dormant);

        local.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn disabled_scheduler_accepts_but_never_fires() {
        let count = Arc::new(AtomicUsize::new(0));
        let registry = JobRegistry::new();
        registry.register_instance("count", Arc::new(Counter(Arc::clone(&count))));
        let config = SchedulerConfig {
            enabled: false,
            tick_interval_ms: 20,
            ..SchedulerConfig::default()
        };
        let local = backend(registry, config);
        local.start().unwrap();

        local.register(JobDefinition::new("g", "a", "count", every(20))).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(local.jobs().len(), 1);

        local.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reregistered_job_waits_for_firing_of_its_predecessor() {
        let job = Arc::new(Overlap::default());
        let registry = JobRegistry::new();
        registry.register_instance("overlap", job.clone());
        let local = backend(registry, SchedulerConfig::default());
        local.start().unwrap();
        let key = JobKey::new("g", "a");

        local.register(JobDefinition::new("g", "a", "overlap", every(3_600_000))).unwrap();
        local.trigger_now(&key).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(job.running.load(Ordering::SeqCst), 1);

        local.unregister(&key).unwrap();
        local.register(JobDefinition::new("g", "a", "overlap", every(3_600_000))).unwrap();
        assert_eq!(local.jobs()[0].state, TriggerState::Firing);
        local.trigger_now(&key).unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;

        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
        assert_eq!(job.max_running.load(Ordering::SeqCst), 1);
        // only the new registration's firing is counted
        let summary = &local.jobs()[0];
        assert_eq!(summary.fire_count, 1);
        assert_eq!(summary.state, TriggerState::Scheduled);

        local.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
