use rusqlite::Connection;

use crate::error::Result;

/// Initialise the clustered scheduler schema in `conn`.
///
/// Idempotent; every node runs it on start against the shared store.
/// All timestamps are epoch milliseconds (UTC).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sched_job_definitions (
            job_group     TEXT    NOT NULL,
            job_id        TEXT    NOT NULL,
            job_type      TEXT    NOT NULL,
            trigger_spec  TEXT    NOT NULL,   -- JSON-encoded TriggerSpec
            durable       INTEGER NOT NULL DEFAULT 0,
            concurrent    INTEGER NOT NULL DEFAULT 0,
            data_map      TEXT    NOT NULL DEFAULT '{}',
            updated_by    TEXT    NOT NULL,
            updated_at    INTEGER NOT NULL,
            PRIMARY KEY (job_group, job_id)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS sched_triggers (
            job_group     TEXT    NOT NULL,
            job_id        TEXT    NOT NULL,
            next_fire_ms  INTEGER,            -- NULL once the trigger is exhausted
            paused        INTEGER NOT NULL DEFAULT 0,
            fire_now_ms   INTEGER,            -- pending manual firing
            updated_at    INTEGER NOT NULL,
            PRIMARY KEY (job_group, job_id)
        ) STRICT;

        -- Due scan: WHERE next_fire_ms <= ?
        CREATE INDEX IF NOT EXISTS idx_sched_triggers_next
            ON sched_triggers (next_fire_ms);

        CREATE TABLE IF NOT EXISTS sched_fire_records (
            job_group         TEXT    NOT NULL,
            job_id            TEXT    NOT NULL,
            fire_instance_id  TEXT    NOT NULL,
            acquired_by       TEXT    NOT NULL,
            acquired_at_ms    INTEGER NOT NULL,
            expires_at_ms     INTEGER NOT NULL,
            PRIMARY KEY (job_group, job_id, fire_instance_id)
        ) STRICT;

        -- Recovery scan: WHERE expires_at_ms < ?
        CREATE INDEX IF NOT EXISTS idx_sched_fire_records_expiry
            ON sched_fire_records (expires_at_ms);
        ",
    )?;
    Ok(())
}
