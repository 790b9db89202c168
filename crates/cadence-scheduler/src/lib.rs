//! `cadence-scheduler`: Tokio-based job scheduler with local and clustered backends.
//!
//! # Overview
//!
//! [`SchedulerService`] is the facade. Callers register [`JobDefinition`]s;
//! a [`JobFactory`] turns each definition's `job_type` into a runnable
//! [`Job`] when it fires. At start the facade picks one backend:
//!
//! | Mode        | Backend                          | Trigger state                  |
//! |-------------|----------------------------------|--------------------------------|
//! | `local`     | [`local::LocalBackend`]          | in memory                      |
//! | `clustered` | [`clustered::ClusteredBackend`]  | shared SQLite ([`ClusterStore`]) |
//!
//! In clustered mode every node scans the shared trigger table and races to
//! claim due firings; one claim transaction wins per fire instance, and its
//! lease is renewed by a heartbeat while the job runs. Claims whose lease
//! expires are recovered by another node, so delivery is at-least-once.
//!
//! # Trigger variants
//!
//! | Variant    | Behaviour                                              |
//! |------------|--------------------------------------------------------|
//! | `Interval` | Repeat every N ms, first fire after a delay (default one period) |
//! | `Cron`     | Calendar expression, 5-field Unix or 6/7-field          |
//! | `Once`     | Single fire at an absolute UTC instant                 |

pub mod backend;
pub mod clustered;
pub mod db;
pub mod error;
pub mod factory;
pub mod job;
pub mod local;
mod pool;
pub mod service;
pub mod store;
pub mod trigger;
pub mod types;

pub use backend::{SchedulerBackend, SchedulerHandle};
pub use error::{Result, SchedulerError};
pub use factory::{JobFactory, JobRegistry};
pub use job::{Job, JobError, JobExecutionContext};
pub use service::SchedulerService;
pub use store::ClusterStore;
pub use types::{
    DataMap, DataValue, FireRecord, FireStatus, JobDefinition, JobKey, JobSummary, TriggerSource,
    TriggerSpec, TriggerState,
};
