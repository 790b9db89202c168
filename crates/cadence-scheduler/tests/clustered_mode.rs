// Two or more nodes sharing one SQLite store through the clustered backend.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::{CadenceConfig, NodeId, SchedulerMode, StoreConfig};
use cadence_scheduler::store::ClaimKind;
use cadence_scheduler::{
    ClusterStore, Job, JobDefinition, JobError, JobExecutionContext, JobRegistry,
    SchedulerService, TriggerSource, TriggerSpec,
};
use chrono::Utc;

/// Records which node ran which fire instance, shared by every node.
#[derive(Default)]
struct Ledger {
    runs: Mutex<Vec<(String, String, TriggerSource)>>,
}

impl Ledger {
    fn runs(&self) -> Vec<(String, String, TriggerSource)> {
        self.runs.lock().unwrap().clone()
    }

    fn per_instance(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for (_, instance, _) in self.runs() {
            *counts.entry(instance).or_insert(0) += 1;
        }
        counts
    }
}

struct Record(Arc<Ledger>);

#[async_trait]
impl Job for Record {
    async fn execute(&self, ctx: &JobExecutionContext) -> Result<(), JobError> {
        self.0.runs.lock().unwrap().push((
            ctx.node_id.to_string(),
            ctx.fire_instance_id.clone(),
            ctx.source,
        ));
        Ok(())
    }
}

fn config(db: &Path, node: &str) -> CadenceConfig {
    let mut config = CadenceConfig::default();
    config.scheduler.mode = SchedulerMode::Clustered;
    config.scheduler.node_id = Some(node.to_string());
    config.scheduler.tick_interval_ms = 20;
    config.scheduler.lease_duration_ms = 300;
    config.store.path = Some(db.to_string_lossy().into_owned());
    config
}

fn node(db: &Path, name: &str, ledger: &Arc<Ledger>) -> SchedulerService {
    let registry = JobRegistry::new();
    registry.register_instance("record", Arc::new(Record(Arc::clone(ledger))));
    let service = SchedulerService::new(Arc::new(registry));
    service.start(&config(db, name)).unwrap();
    service
}

fn every(ms: u64) -> TriggerSpec {
    TriggerSpec::every(Duration::from_millis(ms))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_fire_instance_runs_on_exactly_one_node() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cluster.db");
    let ledger = Arc::new(Ledger::default());
    let a = node(&db, "node-a", &ledger);
    let b = node(&db, "node-b", &ledger);

    let def = JobDefinition::new("cluster", "tick", "record", every(100));
    a.register_job(def.clone()).unwrap();
    b.register_job(def).unwrap();
    tokio::time::sleep(Duration::from_millis(650)).await;

    a.shutdown(Duration::from_secs(1)).await.unwrap();
    b.shutdown(Duration::from_secs(1)).await.unwrap();

    let per_instance = ledger.per_instance();
    assert!(per_instance.len() >= 3, "only {} fire instances", per_instance.len());
    for (instance, count) in per_instance {
        assert_eq!(count, 1, "fire instance {instance} ran {count} times");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn node_local_jobs_fire_on_every_node() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cluster.db");
    let ledger = Arc::new(Ledger::default());
    let a = node(&db, "node-a", &ledger);
    let b = node(&db, "node-b", &ledger);

    let def = JobDefinition::new("cluster", "cache-sweep", "record", every(100)).cluster_aware(false);
    a.register_job(def.clone()).unwrap();
    b.register_job(def).unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;

    a.shutdown(Duration::from_secs(1)).await.unwrap();
    b.shutdown(Duration::from_secs(1)).await.unwrap();

    let runs = ledger.runs();
    assert!(runs.iter().any(|(node, _, _)| node == "node-a"));
    assert!(runs.iter().any(|(node, _, _)| node == "node-b"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manual_trigger_is_claimed_by_one_node() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cluster.db");
    let ledger = Arc::new(Ledger::default());
    let a = node(&db, "node-a", &ledger);
    let b = node(&db, "node-b", &ledger);

    let def = JobDefinition::new("cluster", "report", "record", every(3_600_000));
    a.register_job(def.clone()).unwrap();
    b.register_job(def).unwrap();

    b.trigger_now("cluster", "report").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let runs = ledger.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].2, TriggerSource::Manual);
    assert!(runs[0].1.starts_with("manual-"));

    a.shutdown(Duration::from_secs(1)).await.unwrap();
    b.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unregister_on_one_node_reaches_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cluster.db");
    let ledger = Arc::new(Ledger::default());
    let a = node(&db, "node-a", &ledger);
    let b = node(&db, "node-b", &ledger);

    let def = JobDefinition::new("cluster", "gone", "record", every(3_600_000));
    a.register_job(def.clone()).unwrap();
    b.register_job(def).unwrap();
    assert_eq!(b.jobs().len(), 1);

    a.unregister_job("cluster", "gone").unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(a.jobs().is_empty());
    assert!(b.jobs().is_empty());

    a.shutdown(Duration::from_secs(1)).await.unwrap();
    b.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replaced_definition_is_adopted_by_every_node() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cluster.db");
    let ledger = Arc::new(Ledger::default());
    let a = node(&db, "node-a", &ledger);
    let b = node(&db, "node-b", &ledger);

    a.register_job(JobDefinition::new("cluster", "sweep", "record", every(3_600_000)))
        .unwrap();
    b.register_job(JobDefinition::new("cluster", "sweep", "record", every(3_600_000)))
        .unwrap();
    b.register_job(
        JobDefinition::new("cluster", "sweep", "record", every(100)).with_data("batch", 50i64),
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let seen = &a.jobs()[0];
    assert_eq!(seen.trigger, every(100));
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(ledger.runs().len() >= 2);

    a.shutdown(Duration::from_secs(1)).await.unwrap();
    b.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_is_shared_across_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cluster.db");
    let ledger = Arc::new(Ledger::default());
    let a = node(&db, "node-a", &ledger);
    let b = node(&db, "node-b", &ledger);

    let def = JobDefinition::new("cluster", "paused", "record", every(50));
    a.register_job(def.clone()).unwrap();
    b.register_job(def).unwrap();
    b.pause("cluster", "paused").unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(ledger.runs().is_empty());
    assert_eq!(a.jobs()[0].state, cadence_scheduler::TriggerState::Paused);

    a.resume("cluster", "paused").unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!ledger.runs().is_empty());

    a.shutdown(Duration::from_secs(1)).await.unwrap();
    b.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crashed_nodes_claim_is_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cluster.db");
    let def = JobDefinition::new("cluster", "nightly", "record", every(3_600_000));

    // a node that claims a firing and then disappears without renewing it
    let ghost = ClusterStore::open(
        &StoreConfig {
            path: Some(db.to_string_lossy().into_owned()),
            ..StoreConfig::default()
        },
        NodeId::from("ghost"),
    )
    .unwrap();
    let now_ms = Utc::now().timestamp_millis();
    let due_ms = now_ms - 1_000;
    ghost.upsert_definition(&def, Some(due_ms), now_ms).unwrap();
    let claimed = ghost
        .claim(
            &def.key,
            ClaimKind::Scheduled {
                due_ms,
                next_ms: Some(now_ms + 3_600_000),
            },
            false,
            now_ms,
            50,
        )
        .unwrap();

    let ledger = Arc::new(Ledger::default());
    let survivor = node(&db, "node-b", &ledger);
    survivor.register_job(def).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let runs = ledger.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].0, "node-b");
    assert_eq!(runs[0].1, claimed.fire_instance_id);
    assert_eq!(runs[0].2, TriggerSource::Recovery);
    assert!(ghost.fire_records().unwrap().is_empty());

    survivor.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_releases_unfinished_claims() {
    struct Stuck;

    #[async_trait]
    impl Job for Stuck {
        async fn execute(&self, _ctx: &JobExecutionContext) -> Result<(), JobError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cluster.db");
    let registry = JobRegistry::new();
    registry.register_instance("stuck", Arc::new(Stuck));
    let service = SchedulerService::new(Arc::new(registry));
    service.start(&config(&db, "node-a")).unwrap();

    service
        .register_job(JobDefinition::new("cluster", "stuck", "stuck", every(3_600_000)))
        .unwrap();
    service.trigger_now("cluster", "stuck").unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let err = service.shutdown(Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(
        err,
        cadence_scheduler::SchedulerError::ShutdownIncomplete { cancelled: 1 }
    ));

    // the claim is left expired so any peer can re-fire it immediately
    let observer = ClusterStore::open(
        &StoreConfig {
            path: Some(db.to_string_lossy().into_owned()),
            ..StoreConfig::default()
        },
        NodeId::from("observer"),
    )
    .unwrap();
    let expired = observer.expired_claims(Utc::now().timestamp_millis()).unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].acquired_by, "node-a");
}
