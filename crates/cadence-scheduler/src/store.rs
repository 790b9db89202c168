use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use cadence_core::{NodeId, StoreConfig};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::types::{DataMap, FireRecord, JobDefinition, JobKey, TriggerSpec};

/// Persisted trigger state shared by every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRow {
    pub key: JobKey,
    /// `None` once the trigger is exhausted.
    pub next_fire_ms: Option<i64>,
    pub paused: bool,
    /// Set by `trigger_now` until some node claims the manual firing.
    pub fire_now_ms: Option<i64>,
}

/// What a node is trying to claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    /// The trigger's regular slot `due_ms`; on success the stored trigger
    /// moves to `next_ms`.
    Scheduled { due_ms: i64, next_ms: Option<i64> },
    /// A pending manual request stamped `requested_ms`.
    Manual { requested_ms: i64 },
}

impl ClaimKind {
    /// Fire instance id every node derives identically for the same firing.
    pub fn fire_instance_id(&self) -> String {
        match self {
            ClaimKind::Scheduled { due_ms, .. } => due_ms.to_string(),
            ClaimKind::Manual { requested_ms } => format!("manual-{requested_ms}"),
        }
    }
}

/// SQLite store behind clustered mode.
///
/// Every node opens the same database file. Claims run inside
/// `BEGIN IMMEDIATE` transactions so SQLite serialises competing writers,
/// and lease updates are conditional on the current owner.
pub struct ClusterStore {
    conn: Mutex<Connection>,
    node_id: NodeId,
}

impl ClusterStore {
    /// Open (and initialise) the shared store. Fails with
    /// [`SchedulerError::Configuration`] when it is unreachable.
    pub fn open(config: &StoreConfig, node_id: NodeId) -> Result<Self> {
        let path = config
            .path
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| SchedulerError::Configuration("store.path is required in clustered mode".into()))?;

        let unreachable =
            |e: rusqlite::Error| SchedulerError::Configuration(format!("cluster store {path} unreachable: {e}"));
        let conn = Connection::open(path).map_err(unreachable)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(unreachable)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .map_err(unreachable)?;
        init_db(&conn)?;
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))
            .map_err(unreachable)?;

        info!(path, node = %node_id, "cluster store opened");
        Ok(Self::with_connection(conn, node_id))
    }

    /// Wrap an already-initialised connection.
    pub fn with_connection(conn: Connection, node_id: NodeId) -> Self {
        Self {
            conn: Mutex::new(conn),
            node_id,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Insert or replace a definition.
    ///
    /// The trigger row is reset to `first_fire_ms` only when the trigger spec
    /// changed or no row exists yet, so a node re-registering the same job at
    /// startup does not move the cluster's schedule. Returns whether it was reset.
    pub fn upsert_definition(
        &self,
        def: &JobDefinition,
        first_fire_ms: Option<i64>,
        now_ms: i64,
    ) -> Result<bool> {
        let spec_json = serde_json::to_string(&def.trigger)?;
        let data_json = serde_json::to_string(&def.data_map)?;

        let mut conn = self.conn.lock().expect("store connection poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stored_spec: Option<String> = tx
            .query_row(
                "SELECT trigger_spec FROM sched_job_definitions WHERE job_group = ?1 AND job_id = ?2",
                params![def.key.group, def.key.id],
                |r| r.get(0),
            )
            .optional()?;
        let has_trigger: bool = tx
            .query_row(
                "SELECT 1 FROM sched_triggers WHERE job_group = ?1 AND job_id = ?2",
                params![def.key.group, def.key.id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);

        tx.execute(
            "INSERT INTO sched_job_definitions
             (job_group, job_id, job_type, trigger_spec, durable, concurrent, data_map, updated_by, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(job_group, job_id) DO UPDATE SET
                job_type = excluded.job_type,
                trigger_spec = excluded.trigger_spec,
                durable = excluded.durable,
                concurrent = excluded.concurrent,
                data_map = excluded.data_map,
                updated_by = excluded.updated_by,
                updated_at = excluded.updated_at",
            params![
                def.key.group,
                def.key.id,
                def.job_type,
                spec_json,
                def.durable,
                def.concurrent,
                data_json,
                self.node_id.as_str(),
                now_ms
            ],
        )?;

        let reset = !has_trigger || stored_spec.as_deref() != Some(spec_json.as_str());
        if reset {
            tx.execute(
                "INSERT INTO sched_triggers (job_group, job_id, next_fire_ms, paused, fire_now_ms, updated_at)
                 VALUES (?1, ?2, ?3, 0, NULL, ?4)
                 ON CONFLICT(job_group, job_id) DO UPDATE SET
                    next_fire_ms = excluded.next_fire_ms,
                    fire_now_ms = NULL,
                    updated_at = excluded.updated_at",
                params![def.key.group, def.key.id, first_fire_ms, now_ms],
            )?;
        }
        tx.commit()?;
        Ok(reset)
    }

    /// Remove a job's definition and trigger. Outstanding fire records are
    /// left for their owners to complete.
    pub fn delete_definition(&self, key: &JobKey) -> Result<bool> {
        let mut conn = self.conn.lock().expect("store connection poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let n = tx.execute(
            "DELETE FROM sched_triggers WHERE job_group = ?1 AND job_id = ?2",
            params![key.group, key.id],
        )?;
        let m = tx.execute(
            "DELETE FROM sched_job_definitions WHERE job_group = ?1 AND job_id = ?2",
            params![key.group, key.id],
        )?;
        tx.commit()?;
        Ok(n + m > 0)
    }

    /// Every stored definition, keyed by job. Nodes reconcile their local
    /// copies against this each tick.
    pub fn definitions(&self) -> Result<HashMap<JobKey, JobDefinition>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT job_group, job_id, job_type, trigger_spec, durable, concurrent, data_map
             FROM sched_job_definitions",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    JobKey::new(r.get::<_, String>(0)?, r.get::<_, String>(1)?),
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, bool>(4)?,
                    r.get::<_, bool>(5)?,
                    r.get::<_, String>(6)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut definitions = HashMap::with_capacity(rows.len());
        for (key, job_type, spec_json, durable, concurrent, data_json) in rows {
            let trigger: TriggerSpec = serde_json::from_str(&spec_json)?;
            let mut def = JobDefinition::new(key.group.clone(), key.id.clone(), job_type, trigger)
                .durable(durable)
                .concurrent(concurrent);
            def.data_map = serde_json::from_str::<DataMap>(&data_json)?;
            definitions.insert(key, def);
        }
        Ok(definitions)
    }

    pub fn set_paused(&self, key: &JobKey, paused: bool, now_ms: i64) -> Result<bool> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let n = conn.execute(
            "UPDATE sched_triggers SET paused = ?3, updated_at = ?4
             WHERE job_group = ?1 AND job_id = ?2",
            params![key.group, key.id, paused, now_ms],
        )?;
        Ok(n > 0)
    }

    /// Request a manual firing. A request that is already pending is kept,
    /// so concurrent calls collapse into one firing.
    pub fn request_fire_now(&self, key: &JobKey, now_ms: i64) -> Result<bool> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let n = conn.execute(
            "UPDATE sched_triggers SET fire_now_ms = COALESCE(fire_now_ms, ?3), updated_at = ?3
             WHERE job_group = ?1 AND job_id = ?2",
            params![key.group, key.id, now_ms],
        )?;
        Ok(n > 0)
    }

    /// Triggers with a slot due at `now_ms` or a pending manual request,
    /// earliest first.
    pub fn due_triggers(&self, now_ms: i64) -> Result<Vec<TriggerRow>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT job_group, job_id, next_fire_ms, paused, fire_now_ms
             FROM sched_triggers
             WHERE (paused = 0 AND next_fire_ms <= ?1) OR fire_now_ms IS NOT NULL
             ORDER BY COALESCE(fire_now_ms, next_fire_ms)",
        )?;
        let rows = stmt
            .query_map([now_ms], read_trigger_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn trigger_row(&self, key: &JobKey) -> Result<Option<TriggerRow>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let row = conn
            .query_row(
                "SELECT job_group, job_id, next_fire_ms, paused, fire_now_ms
                 FROM sched_triggers WHERE job_group = ?1 AND job_id = ?2",
                params![key.group, key.id],
                read_trigger_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Try to take ownership of one firing.
    ///
    /// Runs as a single immediate transaction: re-check that the firing is
    /// still due, refuse while a non-concurrent job has a live claim, insert
    /// the fire record, then move the trigger on. Losing at any step is
    /// [`SchedulerError::ClaimConflict`].
    pub fn claim(
        &self,
        key: &JobKey,
        kind: ClaimKind,
        concurrent: bool,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<FireRecord> {
        let fire_instance_id = kind.fire_instance_id();
        let conflict = || SchedulerError::ClaimConflict {
            key: key.clone(),
            fire_instance_id: fire_instance_id.clone(),
        };

        let mut conn = self.conn.lock().expect("store connection poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row = tx
            .query_row(
                "SELECT job_group, job_id, next_fire_ms, paused, fire_now_ms
                 FROM sched_triggers WHERE job_group = ?1 AND job_id = ?2",
                params![key.group, key.id],
                read_trigger_row,
            )
            .optional()?
            .ok_or_else(conflict)?;
        let still_due = match kind {
            ClaimKind::Scheduled { due_ms, .. } => !row.paused && row.next_fire_ms == Some(due_ms),
            ClaimKind::Manual { requested_ms } => row.fire_now_ms == Some(requested_ms),
        };
        if !still_due {
            return Err(conflict());
        }

        if !concurrent {
            let live: i64 = tx.query_row(
                "SELECT COUNT(*) FROM sched_fire_records
                 WHERE job_group = ?1 AND job_id = ?2 AND expires_at_ms > ?3",
                params![key.group, key.id, now_ms],
                |r| r.get(0),
            )?;
            if live > 0 {
                return Err(conflict());
            }
        }

        let expires_ms = now_ms + lease_ms;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO sched_fire_records
             (job_group, job_id, fire_instance_id, acquired_by, acquired_at_ms, expires_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![key.group, key.id, fire_instance_id, self.node_id.as_str(), now_ms, expires_ms],
        )?;
        if inserted == 0 {
            return Err(conflict());
        }

        match kind {
            ClaimKind::Scheduled { next_ms, .. } => tx.execute(
                "UPDATE sched_triggers SET next_fire_ms = ?3, updated_at = ?4
                 WHERE job_group = ?1 AND job_id = ?2",
                params![key.group, key.id, next_ms, now_ms],
            )?,
            ClaimKind::Manual { .. } => tx.execute(
                "UPDATE sched_triggers SET fire_now_ms = NULL, updated_at = ?3
                 WHERE job_group = ?1 AND job_id = ?2",
                params![key.group, key.id, now_ms],
            )?,
        };
        tx.commit()?;

        Ok(FireRecord {
            key: key.clone(),
            fire_instance_id,
            acquired_by: self.node_id.to_string(),
            acquired_at: from_ms(now_ms),
            expires_at: from_ms(expires_ms),
        })
    }

    /// Extend this node's lease on a firing. `false` means the claim was lost.
    pub fn renew(&self, key: &JobKey, fire_instance_id: &str, expires_ms: i64) -> Result<bool> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let n = conn.execute(
            "UPDATE sched_fire_records SET expires_at_ms = ?4
             WHERE job_group = ?1 AND job_id = ?2 AND fire_instance_id = ?3 AND acquired_by = ?5",
            params![key.group, key.id, fire_instance_id, expires_ms, self.node_id.as_str()],
        )?;
        Ok(n > 0)
    }

    /// Delete the fire record of a finished firing.
    ///
    /// With `misfire = Some((now_ms, threshold_ms))` the stored next fire is
    /// pulled to `now_ms` when it is already more than the threshold in the
    /// past. Returns whether that happened.
    pub fn complete_firing(
        &self,
        key: &JobKey,
        fire_instance_id: &str,
        misfire: Option<(i64, i64)>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().expect("store connection poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM sched_fire_records
             WHERE job_group = ?1 AND job_id = ?2 AND fire_instance_id = ?3 AND acquired_by = ?4",
            params![key.group, key.id, fire_instance_id, self.node_id.as_str()],
        )?;
        let misfired = match misfire {
            Some((now_ms, threshold_ms)) => {
                tx.execute(
                    "UPDATE sched_triggers SET next_fire_ms = ?3, updated_at = ?3
                     WHERE job_group = ?1 AND job_id = ?2
                       AND next_fire_ms IS NOT NULL AND next_fire_ms < ?3 - ?4",
                    params![key.group, key.id, now_ms, threshold_ms],
                )? > 0
            }
            None => false,
        };
        tx.commit()?;
        Ok(misfired)
    }

    /// Mark one of this node's claims expired so any node can re-fire it now.
    pub fn release(&self, key: &JobKey, fire_instance_id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let n = conn.execute(
            "UPDATE sched_fire_records SET expires_at_ms = 0
             WHERE job_group = ?1 AND job_id = ?2 AND fire_instance_id = ?3 AND acquired_by = ?4",
            params![key.group, key.id, fire_instance_id, self.node_id.as_str()],
        )?;
        Ok(n > 0)
    }

    /// Expire every claim this node still holds. Used at shutdown.
    pub fn release_node_claims(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let n = conn.execute(
            "UPDATE sched_fire_records SET expires_at_ms = 0 WHERE acquired_by = ?1",
            params![self.node_id.as_str()],
        )?;
        if n > 0 {
            info!(node = %self.node_id, released = n, "released unfinished claims");
        }
        Ok(n)
    }

    /// Claims whose lease ran out before `now_ms`.
    pub fn expired_claims(&self, now_ms: i64) -> Result<Vec<FireRecord>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT job_group, job_id, fire_instance_id, acquired_by, acquired_at_ms, expires_at_ms
             FROM sched_fire_records WHERE expires_at_ms < ?1
             ORDER BY acquired_at_ms",
        )?;
        let records = stmt
            .query_map([now_ms], read_fire_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Take over an expired claim. The update only applies while the record
    /// is unchanged since it was read, so exactly one node wins. For a
    /// non-concurrent job it also waits until no other claim on the job is live.
    pub fn reclaim(
        &self,
        record: &FireRecord,
        concurrent: bool,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let n = conn.execute(
            "UPDATE sched_fire_records
             SET acquired_by = ?4, acquired_at_ms = ?5, expires_at_ms = ?6
             WHERE job_group = ?1 AND job_id = ?2 AND fire_instance_id = ?3
               AND acquired_by = ?7 AND expires_at_ms = ?8 AND expires_at_ms < ?5
               AND (?9 OR NOT EXISTS (
                   SELECT 1 FROM sched_fire_records live
                   WHERE live.job_group = ?1 AND live.job_id = ?2
                     AND live.fire_instance_id <> ?3 AND live.expires_at_ms > ?5
               ))",
            params![
                record.key.group,
                record.key.id,
                record.fire_instance_id,
                self.node_id.as_str(),
                now_ms,
                now_ms + lease_ms,
                record.acquired_by,
                to_ms(record.expires_at),
                concurrent
            ],
        )?;
        if n > 0 {
            debug!(
                job = %record.key,
                fire_instance = %record.fire_instance_id,
                previous_owner = %record.acquired_by,
                "expired claim taken over"
            );
        }
        Ok(n > 0)
    }

    /// Delete expired claims on jobs that no longer exist. Nobody would ever
    /// recover them.
    pub fn purge_orphaned_claims(&self, now_ms: i64) -> Result<usize> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let n = conn.execute(
            "DELETE FROM sched_fire_records
             WHERE expires_at_ms < ?1
               AND NOT EXISTS (
                   SELECT 1 FROM sched_triggers t
                   WHERE t.job_group = sched_fire_records.job_group
                     AND t.job_id = sched_fire_records.job_id
               )",
            [now_ms],
        )?;
        if n > 0 {
            debug!(purged = n, "dropped expired claims of removed jobs");
        }
        Ok(n)
    }

    /// Every outstanding fire record, oldest first.
    pub fn fire_records(&self) -> Result<Vec<FireRecord>> {
        self.expired_claims(i64::MAX)
    }

    /// Drop a non-durable job whose trigger is exhausted and idle.
    pub fn remove_if_exhausted(&self, key: &JobKey) -> Result<bool> {
        let mut conn = self.conn.lock().expect("store connection poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let n = tx.execute(
            "DELETE FROM sched_triggers
             WHERE job_group = ?1 AND job_id = ?2
               AND next_fire_ms IS NULL AND fire_now_ms IS NULL
               AND NOT EXISTS (
                   SELECT 1 FROM sched_fire_records r
                   WHERE r.job_group = ?1 AND r.job_id = ?2
               )",
            params![key.group, key.id],
        )?;
        if n > 0 {
            tx.execute(
                "DELETE FROM sched_job_definitions WHERE job_group = ?1 AND job_id = ?2",
                params![key.group, key.id],
            )?;
        }
        tx.commit()?;
        Ok(n > 0)
    }
}

fn read_trigger_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<TriggerRow> {
    Ok(TriggerRow {
        key: JobKey::new(r.get::<_, String>(0)?, r.get::<_, String>(1)?),
        next_fire_ms: r.get(2)?,
        paused: r.get(3)?,
        fire_now_ms: r.get(4)?,
    })
}

fn read_fire_record(r: &rusqlite::Row<'_>) -> rusqlite::Result<FireRecord> {
    Ok(FireRecord {
        key: JobKey::new(r.get::<_, String>(0)?, r.get::<_, String>(1)?),
        fire_instance_id: r.get(2)?,
        acquired_by: r.get(3)?,
        acquired_at: from_ms(r.get(4)?),
        expires_at: from_ms(r.get(5)?),
    })
}

pub(crate) fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(conn: Connection, node: &str) -> ClusterStore {
        init_db(&conn).unwrap();
        ClusterStore::with_connection(conn, NodeId::from(node))
    }

    fn shared_pair() -> (tempfile::TempDir, ClusterStore, ClusterStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.db");
        let a = store(Connection::open(&path).unwrap(), "node-a");
        let b = store(Connection::open(&path).unwrap(), "node-b");
        (dir, a, b)
    }

    fn def() -> JobDefinition {
        JobDefinition::new("g", "a", "count", TriggerSpec::every(Duration::from_secs(1)))
    }

    #[test]
    fn open_without_path_is_configuration_error() {
        let err = ClusterStore::open(&StoreConfig::default(), NodeId::from("n")).err().unwrap();
        assert!(matches!(err, SchedulerError::Configuration(_)));
    }

    #[test]
    fn reregistering_same_spec_keeps_schedule() {
        let s = store(Connection::open_in_memory().unwrap(), "node-a");
        assert!(s.upsert_definition(&def(), Some(1_000), 0).unwrap());
        assert!(!s.upsert_definition(&def(), Some(9_000), 5).unwrap());
        assert_eq!(s.trigger_row(&def().key).unwrap().unwrap().next_fire_ms, Some(1_000));

        let changed = JobDefinition::new("g", "a", "count", TriggerSpec::every(Duration::from_secs(2)));
        assert!(s.upsert_definition(&changed, Some(9_000), 5).unwrap());
        assert_eq!(s.trigger_row(&def().key).unwrap().unwrap().next_fire_ms, Some(9_000));

        let loaded = s.definitions().unwrap().remove(&def().key).unwrap();
        assert_eq!(loaded, changed);
    }

    #[test]
    fn only_one_node_wins_a_fire_instance() {
        let (_dir, a, b) = shared_pair();
        a.upsert_definition(&def(), Some(1_000), 0).unwrap();
        let kind = ClaimKind::Scheduled { due_ms: 1_000, next_ms: Some(2_000) };

        let won = a.claim(&def().key, kind, false, 1_001, 30_000).unwrap();
        assert_eq!(won.fire_instance_id, "1000");
        assert_eq!(won.acquired_by, "node-a");

        let lost = b.claim(&def().key, kind, false, 1_002, 30_000).unwrap_err();
        assert!(matches!(lost, SchedulerError::ClaimConflict { .. }));
        assert_eq!(b.trigger_row(&def().key).unwrap().unwrap().next_fire_ms, Some(2_000));
    }

    #[test]
    fn live_claim_blocks_next_slot_of_non_concurrent_job() {
        let (_dir, a, b) = shared_pair();
        a.upsert_definition(&def(), Some(1_000), 0).unwrap();
        a.claim(&def().key, ClaimKind::Scheduled { due_ms: 1_000, next_ms: Some(2_000) }, false, 1_000, 30_000)
            .unwrap();

        let next = ClaimKind::Scheduled { due_ms: 2_000, next_ms: Some(3_000) };
        assert!(b.claim(&def().key, next, false, 2_000, 30_000).is_err());
        assert!(b.claim(&def().key, next, true, 2_000, 30_000).is_ok());
    }

    #[test]
    fn expired_claim_is_reclaimed_once() {
        let (_dir, a, b) = shared_pair();
        a.upsert_definition(&def(), Some(1_000), 0).unwrap();
        a.claim(&def().key, ClaimKind::Scheduled { due_ms: 1_000, next_ms: Some(2_000) }, false, 1_000, 100)
            .unwrap();

        assert!(b.expired_claims(1_050).unwrap().is_empty());
        let expired = b.expired_claims(1_200).unwrap();
        assert_eq!(expired.len(), 1);

        assert!(b.reclaim(&expired[0], false, 1_200, 100).unwrap());
        // a second taker with the stale read loses
        assert!(!a.reclaim(&expired[0], false, 1_200, 100).unwrap());
        assert_eq!(a.fire_records().unwrap()[0].acquired_by, "node-b");
        // the crashed owner can no longer renew
        assert!(!a.renew(&def().key, "1000", 5_000).unwrap());
    }

    #[test]
    fn manual_request_collapses_and_is_claimed_once() {
        let (_dir, a, b) = shared_pair();
        a.upsert_definition(&def(), Some(60_000), 0).unwrap();
        assert!(a.request_fire_now(&def().key, 500).unwrap());
        assert!(b.request_fire_now(&def().key, 600).unwrap());

        let row = a.trigger_row(&def().key).unwrap().unwrap();
        assert_eq!(row.fire_now_ms, Some(500));
        assert_eq!(a.due_triggers(700).unwrap().len(), 1);

        let kind = ClaimKind::Manual { requested_ms: 500 };
        assert_eq!(a.claim(&def().key, kind, true, 700, 30_000).unwrap().fire_instance_id, "manual-500");
        assert!(b.claim(&def().key, kind, true, 700, 30_000).is_err());
        assert!(a.due_triggers(700).unwrap().is_empty());
    }

    #[test]
    fn completion_applies_misfire_rule() {
        let s = store(Connection::open_in_memory().unwrap(), "node-a");
        s.upsert_definition(&def(), Some(1_000), 0).unwrap();
        s.claim(&def().key, ClaimKind::Scheduled { due_ms: 1_000, next_ms: Some(2_000) }, false, 1_000, 30_000)
            .unwrap();

        // finished at 5_000 with threshold 500: slot 2_000 is long gone
        assert!(s.complete_firing(&def().key, "1000", Some((5_000, 500))).unwrap());
        assert_eq!(s.trigger_row(&def().key).unwrap().unwrap().next_fire_ms, Some(5_000));
        assert!(s.fire_records().unwrap().is_empty());
    }

    #[test]
    fn released_claims_expire_immediately() {
        let s = store(Connection::open_in_memory().unwrap(), "node-a");
        s.upsert_definition(&def(), Some(1_000), 0).unwrap();
        s.claim(&def().key, ClaimKind::Scheduled { due_ms: 1_000, next_ms: Some(2_000) }, false, 1_000, 30_000)
            .unwrap();
        assert_eq!(s.release_node_claims().unwrap(), 1);
        assert_eq!(s.expired_claims(1_001).unwrap().len(), 1);
    }

    #[test]
    fn exhausted_job_removed_only_when_idle() {
        let s = store(Connection::open_in_memory().unwrap(), "node-a");
        let once = JobDefinition::new("g", "once", "count", TriggerSpec::once(from_ms(1_000)));
        s.upsert_definition(&once, Some(1_000), 0).unwrap();
        s.claim(&once.key, ClaimKind::Scheduled { due_ms: 1_000, next_ms: None }, false, 1_000, 30_000)
            .unwrap();

        assert!(!s.remove_if_exhausted(&once.key).unwrap());
        s.complete_firing(&once.key, "1000", None).unwrap();
        assert!(s.remove_if_exhausted(&once.key).unwrap());
        assert!(!s.definitions().unwrap().contains_key(&once.key));
    }

    #[test]
    fn recovery_waits_for_live_claim_of_non_concurrent_job() {
        let (_dir, a, b) = shared_pair();
        a.upsert_definition(&def(), Some(1_000), 0).unwrap();
        a.claim(&def().key, ClaimKind::Scheduled { due_ms: 1_000, next_ms: Some(2_000) }, false, 1_000, 100)
            .unwrap();
        // a goes silent; b fires the next slot while the old claim is expired
        b.claim(&def().key, ClaimKind::Scheduled { due_ms: 2_000, next_ms: Some(3_000) }, false, 2_000, 30_000)
            .unwrap();

        let expired = b.expired_claims(2_050).unwrap();
        assert_eq!(expired.len(), 1);
        assert!(!b.reclaim(&expired[0], false, 2_050, 30_000).unwrap());
        assert!(b.reclaim(&expired[0], true, 2_050, 30_000).unwrap());
    }

    #[test]
    fn orphaned_expired_claims_are_purged() {
        let (_dir, a, b) = shared_pair();
        let other = JobDefinition::new("g", "b", "count", TriggerSpec::every(Duration::from_secs(1)));
        a.upsert_definition(&def(), Some(1_000), 0).unwrap();
        a.upsert_definition(&other, Some(1_000), 0).unwrap();
        a.claim(&def().key, ClaimKind::Scheduled { due_ms: 1_000, next_ms: Some(2_000) }, false, 1_000, 100)
            .unwrap();
        a.claim(&other.key, ClaimKind::Scheduled { due_ms: 1_000, next_ms: Some(2_000) }, false, 1_000, 100)
            .unwrap();
        b.delete_definition(&def().key).unwrap();

        // only the claim on the removed job goes; the other stays recoverable
        assert_eq!(b.purge_orphaned_claims(1_050).unwrap(), 0);
        assert_eq!(b.purge_orphaned_claims(1_200).unwrap(), 1);
        let left = b.fire_records().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].key, other.key);
    }
}
