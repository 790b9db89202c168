use thiserror::Error;

use crate::types::JobKey;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid mode, unreachable store or an exhausted due queue. Fatal at startup/registration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The job definition was rejected at registration; the caller must fix it.
    #[error("Invalid job definition {key}: {reason}")]
    InvalidDefinition { key: String, reason: String },

    /// The job factory has no constructor for this job type.
    #[error("Unknown job type: {job_type}")]
    UnknownJobType { job_type: String },

    /// Another node won the claim for this fire instance. Routine, not a fault.
    #[error("Fire instance {fire_instance_id} of {key} already claimed")]
    ClaimConflict { key: JobKey, fire_instance_id: String },

    /// Shutdown timed out and had to cancel in-flight firings.
    #[error("Shutdown incomplete: {cancelled} firing(s) cancelled")]
    ShutdownIncomplete { cancelled: usize },

    /// The operation needs a started scheduler.
    #[error("Scheduler not started")]
    NotStarted,

    /// Underlying SQLite / rusqlite error.
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedulerError {
    /// Short error code string for structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Configuration(_) => "CONFIGURATION_ERROR",
            SchedulerError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            SchedulerError::UnknownJobType { .. } => "UNKNOWN_JOB_TYPE",
            SchedulerError::ClaimConflict { .. } => "CLAIM_CONFLICT",
            SchedulerError::ShutdownIncomplete { .. } => "SHUTDOWN_INCOMPLETE",
            SchedulerError::NotStarted => "NOT_STARTED",
            SchedulerError::Store(_) => "STORE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    pub(crate) fn invalid(key: &JobKey, reason: impl Into<String>) -> Self {
        SchedulerError::InvalidDefinition {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<cadence_core::CadenceError> for SchedulerError {
    fn from(e: cadence_core::CadenceError) -> Self {
        SchedulerError::Configuration(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
