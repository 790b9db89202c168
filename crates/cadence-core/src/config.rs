use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};
use crate::types::{NodeId, SchedulerMode};

pub const DEFAULT_THREAD_POOL_SIZE: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_LEASE_DURATION_MS: u64 = 30_000;
pub const DEFAULT_MISFIRE_THRESHOLD_MS: u64 = 5_000;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const MAX_TICK_INTERVAL_MS: u64 = 1_000; // clock must scan at least once a second
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub mode: SchedulerMode,
    /// Maximum number of firings executing at once.
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,
    /// Capacity of the clock → worker due queue. Each registered job holds at
    /// most one queued firing, so this also caps the number of jobs.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Fire-claim lease length. Clustered mode only.
    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,
    #[serde(default = "default_misfire_threshold_ms")]
    pub misfire_threshold_ms: u64,
    /// Upper bound on how long the clock sleeps between scans.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Stable node identity; a fresh UUIDv7 is used when unset.
    #[serde(default)]
    pub node_id: Option<String>,
    /// When false, jobs can still be registered but nothing fires.
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: SchedulerMode::Local,
            thread_pool_size: DEFAULT_THREAD_POOL_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            lease_duration_ms: DEFAULT_LEASE_DURATION_MS,
            misfire_threshold_ms: DEFAULT_MISFIRE_THRESHOLD_MS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            node_id: None,
            enabled: true,
        }
    }
}

impl SchedulerConfig {
    pub fn node_id(&self) -> NodeId {
        self.node_id
            .as_deref()
            .map(NodeId::from)
            .unwrap_or_default()
    }
}

/// Shared store used by clustered mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file shared by every node of the cluster.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_thread_pool_size() -> usize {
    DEFAULT_THREAD_POOL_SIZE
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_lease_duration_ms() -> u64 {
    DEFAULT_LEASE_DURATION_MS
}
fn default_misfire_threshold_ms() -> u64 {
    DEFAULT_MISFIRE_THRESHOLD_MS
}
fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore:
    /// `CADENCE_SCHEDULER__THREAD_POOL_SIZE=8`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| CadenceError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject option combinations the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.thread_pool_size == 0 {
            return Err(CadenceError::Config("scheduler.thread_pool_size must be > 0".into()));
        }
        if s.queue_capacity == 0 {
            return Err(CadenceError::Config("scheduler.queue_capacity must be > 0".into()));
        }
        if s.tick_interval_ms == 0 || s.tick_interval_ms > MAX_TICK_INTERVAL_MS {
            return Err(CadenceError::Config(format!(
                "scheduler.tick_interval_ms must be within 1..={MAX_TICK_INTERVAL_MS}"
            )));
        }
        if s.mode == SchedulerMode::Clustered {
            if s.lease_duration_ms == 0 {
                return Err(CadenceError::Config(
                    "scheduler.lease_duration_ms must be > 0 in clustered mode".into(),
                ));
            }
            if self.store.path.as_deref().map_or(true, str::is_empty) {
                return Err(CadenceError::Config(
                    "store.path is required in clustered mode".into(),
                ));
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
