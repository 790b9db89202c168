pub mod config;
pub mod error;
pub mod types;

pub use config::{CadenceConfig, SchedulerConfig, StoreConfig};
pub use error::{CadenceError, Result};
pub use types::{NodeId, SchedulerMode};
