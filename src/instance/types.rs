use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Host-assigned identifier for one configured server instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl InstanceStatus {
    /// A live instance owns a process handle; a terminal one does not.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Legal transitions. `Stopped` is reachable from any live state on
    /// process exit. `Error` is reachable from every live state and from
    /// `Stopped` (a launch can fail before anything spawns).
    pub(crate) fn can_transition(self, next: Self) -> bool {
        match (self, next) {
            (Self::Stopped | Self::Error, Self::Starting) => true,
            (Self::Starting, Self::Running) => true,
            (Self::Starting | Self::Running, Self::Stopping) => true,
            (Self::Starting | Self::Running | Self::Stopping, Self::Stopped) => true,
            (Self::Stopped | Self::Starting | Self::Running | Self::Stopping, Self::Error) => true,
            _ => false,
        }
    }
}

impl Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}
