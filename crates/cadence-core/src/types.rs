use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one scheduler process (UUIDv7 unless configured).
///
/// Written into every fire claim as `acquired_by`, so it must be unique across
/// all nodes sharing a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        // UUIDv7 includes a timestamp, so ids sort when reading claim tables by hand
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which backend the scheduler facade runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerMode {
    /// Single process, in-memory triggers.
    #[default]
    Local,
    /// Several processes sharing one persisted schedule.
    Clustered,
}

impl fmt::Display for SchedulerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerMode::Local => "local",
            SchedulerMode::Clustered => "clustered",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SchedulerMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local" => Ok(SchedulerMode::Local),
            "clustered" => Ok(SchedulerMode::Clustered),
            other => Err(format!("unknown scheduler mode: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_unique() {
        assert_ne!(NodeId::new(), NodeId::new());
    }

    #[test]
    fn mode_parses_and_displays() {
        assert_eq!("clustered".parse::<SchedulerMode>().unwrap(), SchedulerMode::Clustered);
        assert_eq!(SchedulerMode::Local.to_string(), "local");
        assert!("mesh".parse::<SchedulerMode>().is_err());
    }
}
