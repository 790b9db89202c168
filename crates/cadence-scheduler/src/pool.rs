use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_core::{NodeId, SchedulerConfig};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::SchedulerHandle;
use crate::factory::JobFactory;
use crate::job::{JobError, JobExecutionContext};
use crate::trigger;
use crate::types::{FireStatus, JobDefinition, JobKey, TriggerSource};

/// How long cancelled firings get to unwind before their tasks are aborted.
const COOPERATIVE_GRACE: Duration = Duration::from_millis(100);

/// One concrete firing travelling from a clock to a worker.
pub(crate) struct Firing {
    pub definition: Arc<JobDefinition>,
    pub fire_instance_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub source: TriggerSource,
    /// Registration generation the firing was promoted under.
    pub generation: u64,
}

impl Firing {
    pub fn key(&self) -> &JobKey {
        &self.definition.key
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FireOutcome {
    pub status: FireStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    /// Time the trigger's cadence continues from: the scheduled slot, or the
    /// actual start when the firing misfired.
    pub anchor: DateTime<Utc>,
    pub misfired: bool,
}

/// Feeds firing results back to the backend that promoted them.
pub(crate) trait FireListener: Send + Sync {
    /// A worker picked the firing up.
    fn on_start(&self, firing: &Firing);

    /// The firing ended. Also called with [`FireStatus::Abandoned`] for
    /// firings discarded from the queue, without a preceding `on_start`.
    fn on_complete(&self, firing: &Firing, outcome: &FireOutcome);
}

pub(crate) struct FireRequest {
    pub firing: Firing,
    pub listener: Arc<dyn FireListener>,
}

struct InFlight {
    key: JobKey,
    fire_instance_id: String,
    abort: AbortHandle,
}

/// Bounded worker pool shared by every clock of a backend.
///
/// Clocks push due firings into a bounded queue; a single dispatcher task
/// takes them in order and runs each on its own task once one of the
/// `thread_pool_size` permits is free.
#[derive(Clone)]
pub(crate) struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    tx: mpsc::Sender<FireRequest>,
    rx: Mutex<Option<mpsc::Receiver<FireRequest>>>,
    permits: Arc<Semaphore>,
    workers: usize,
    factory: Arc<dyn JobFactory>,
    handle: SchedulerHandle,
    node_id: NodeId,
    misfire_threshold: chrono::Duration,
    /// Stops the dispatcher and refuses new submissions.
    closed: CancellationToken,
    /// Parent of every job's cancellation token.
    job_cancel: CancellationToken,
    in_flight: DashMap<u64, InFlight>,
    in_flight_count: watch::Sender<usize>,
    next_id: AtomicU64,
}

impl WorkerPool {
    pub fn new(
        config: &SchedulerConfig,
        factory: Arc<dyn JobFactory>,
        handle: SchedulerHandle,
        node_id: NodeId,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (in_flight_count, _) = watch::channel(0usize);
        Self {
            inner: Arc::new(PoolInner {
                tx,
                rx: Mutex::new(Some(rx)),
                permits: Arc::new(Semaphore::new(config.thread_pool_size)),
                workers: config.thread_pool_size,
                factory,
                handle,
                node_id,
                misfire_threshold: trigger::millis(config.misfire_threshold_ms),
                closed: CancellationToken::new(),
                job_cancel: CancellationToken::new(),
                in_flight: DashMap::new(),
                in_flight_count,
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Spawn the dispatcher. A second call is a no-op.
    pub fn start(&self) {
        let Some(rx) = self.inner.rx.lock().expect("pool receiver poisoned").take() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.dispatch(rx).await });
        info!(workers = self.inner.workers, "worker pool started");
    }

    /// Queue a firing without blocking. The request comes back when the pool
    /// is closed or the queue is full.
    pub fn submit(&self, request: FireRequest) -> std::result::Result<(), FireRequest> {
        if self.inner.closed.is_cancelled() {
            return Err(request);
        }
        self.inner.tx.try_send(request).map_err(|e| match e {
            TrySendError::Full(r) | TrySendError::Closed(r) => r,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight_count.borrow()
    }

    /// Close the pool, drop queued firings, wait up to `timeout` for running
    /// ones, then cancel the stragglers. Returns how many were cancelled.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.inner.closed.cancel();
        let idle = self.inner.in_flight_count.subscribe();

        if tokio::time::timeout(timeout, wait_idle(idle.clone())).await.is_ok() {
            info!("worker pool drained");
            return 0;
        }

        let cancelled = self.inner.in_flight.len();
        warn!(
            cancelled,
            timeout_ms = timeout.as_millis() as u64,
            "shutdown timeout reached; cancelling in-flight firings"
        );
        self.inner.job_cancel.cancel();

        if tokio::time::timeout(COOPERATIVE_GRACE, wait_idle(idle.clone())).await.is_err() {
            for entry in self.inner.in_flight.iter() {
                warn!(
                    job = %entry.key,
                    fire_instance = %entry.fire_instance_id,
                    "aborting firing that ignored cancellation"
                );
                entry.abort.abort();
            }
            let _ = tokio::time::timeout(COOPERATIVE_GRACE, wait_idle(idle)).await;
        }
        cancelled
    }
}

impl PoolInner {
    async fn dispatch(self: Arc<Self>, mut rx: mpsc::Receiver<FireRequest>) {
        loop {
            let request = tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                request = rx.recv() => match request {
                    Some(r) => r,
                    None => break,
                },
            };

            let permit = tokio::select! {
                biased;
                _ = self.closed.cancelled() => {
                    self.abandon(request);
                    break;
                }
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => {
                        self.abandon(request);
                        break;
                    }
                },
            };

            self.fire(request, permit);
        }

        rx.close();
        while let Ok(request) = rx.try_recv() {
            self.abandon(request);
        }
        debug!("dispatcher stopped");
    }

    fn fire(self: &Arc<Self>, request: FireRequest, permit: OwnedSemaphorePermit) {
        let FireRequest { firing, listener } = request;
        let key = firing.key().clone();
        let started_at = Utc::now();
        let (anchor, misfired) =
            trigger::cadence_anchor(firing.scheduled_for, started_at, self.misfire_threshold);
        if misfired {
            warn!(
                job = %key,
                fire_instance = %firing.fire_instance_id,
                scheduled_for = %firing.scheduled_for,
                late_ms = (started_at - firing.scheduled_for).num_milliseconds(),
                "misfire: firing started late, cadence restarts from now"
            );
        }
        listener.on_start(&firing);

        let ctx = JobExecutionContext::new(
            Arc::clone(&firing.definition),
            firing.fire_instance_id.clone(),
            firing.scheduled_for,
            started_at,
            firing.source,
            self.node_id.clone(),
            self.job_cancel.child_token(),
            self.handle.clone(),
        );
        // Construction and body both run on their own task, so a panic in
        // either surfaces as a JoinError here and the dispatcher keeps going.
        let factory = Arc::clone(&self.factory);
        let body = tokio::spawn(async move {
            match factory.create(&ctx.definition) {
                Ok(job) => job.execute(&ctx).await,
                Err(e) => Err(JobError::failed(format!("cannot build job: {e}"))),
            }
        });

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(
            id,
            InFlight {
                key: key.clone(),
                fire_instance_id: firing.fire_instance_id.clone(),
                abort: body.abort_handle(),
            },
        );
        self.in_flight_count.send_modify(|n| *n += 1);
        debug!(job = %key, fire_instance = %firing.fire_instance_id, source = %firing.source, "firing started");

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let status = match body.await {
                Ok(Ok(())) => FireStatus::Succeeded,
                Ok(Err(JobError::Cancelled)) => FireStatus::Cancelled,
                Ok(Err(e)) => {
                    error!(
                        job = %key,
                        fire_instance = %firing.fire_instance_id,
                        scheduled_for = %firing.scheduled_for,
                        error = %e,
                        "job failed"
                    );
                    FireStatus::Failed { message: e.to_string() }
                }
                Err(e) if e.is_cancelled() => FireStatus::Cancelled,
                Err(e) => {
                    let message = panic_message(e);
                    error!(
                        job = %key,
                        fire_instance = %firing.fire_instance_id,
                        scheduled_for = %firing.scheduled_for,
                        error = %message,
                        "job panicked"
                    );
                    FireStatus::Failed { message: format!("job panicked: {message}") }
                }
            };

            if status == FireStatus::Cancelled {
                info!(job = %key, fire_instance = %firing.fire_instance_id, "firing cancelled");
            } else {
                debug!(job = %key, fire_instance = %firing.fire_instance_id, "firing completed");
            }

            let outcome = FireOutcome {
                status,
                started_at: Some(started_at),
                finished_at: Utc::now(),
                anchor,
                misfired,
            };
            listener.on_complete(&firing, &outcome);
            drop(permit);

            inner.in_flight.remove(&id);
            inner.in_flight_count.send_modify(|n| *n = n.saturating_sub(1));
        });
    }

    fn abandon(&self, request: FireRequest) {
        let FireRequest { firing, listener } = request;
        debug!(job = %firing.key(), fire_instance = %firing.fire_instance_id, "discarding queued firing");
        let outcome = FireOutcome {
            status: FireStatus::Abandoned,
            started_at: None,
            finished_at: Utc::now(),
            anchor: firing.scheduled_for,
            misfired: false,
        };
        listener.on_complete(&firing, &outcome);
    }
}

async fn wait_idle(mut rx: watch::Receiver<usize>) {
    while *rx.borrow_and_update() != 0 {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn panic_message(e: JoinError) -> String {
    match e.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string()),
        Err(e) => e.to_string(),
    }
}
