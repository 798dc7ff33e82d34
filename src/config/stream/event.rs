use std::fmt::{self, Display};

#[cfg(feature = "events")]
use uuid::Uuid;

use crate::instance::{InstanceId, InstanceStatus};

use super::line::StreamLine;

/// Lifecycle markers recognized inside the tailed game log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalEvent {
    ServerAdvertising,
    ServerClosing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    StateChange {
        old: InstanceStatus,
        new: InstanceStatus,
    },

    StdLine {
        line: StreamLine,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceEvent {
    #[cfg(feature = "events")]
    pub id: Uuid,

    #[cfg(feature = "events")]
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub instance_id: InstanceId,

    pub payload: EventPayload,
}

impl InstanceEvent {
    pub fn log_line<S: Into<String>>(instance_id: InstanceId, line: S) -> Self {
        Self::from_line(instance_id, StreamLine::log_file(line))
    }

    pub fn from_line(instance_id: InstanceId, line: StreamLine) -> Self {
        #[cfg(feature = "events")]
        let timestamp = line.extract_timestamp().unwrap_or_else(chrono::Utc::now);

        Self {
            #[cfg(feature = "events")]
            id: Uuid::new_v4(),
            #[cfg(feature = "events")]
            timestamp,
            instance_id,
            payload: EventPayload::StdLine { line },
        }
    }

    pub fn state_change(
        instance_id: InstanceId,
        old: InstanceStatus,
        new: InstanceStatus,
    ) -> Self {
        Self {
            #[cfg(feature = "events")]
            id: Uuid::new_v4(),
            #[cfg(feature = "events")]
            timestamp: chrono::Utc::now(),
            instance_id,
            payload: EventPayload::StateChange { old, new },
        }
    }
}

impl Display for InstanceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            EventPayload::StdLine { line } => write!(f, "[{}] {}", self.instance_id, line),
            EventPayload::StateChange { old, new } => {
                write!(f, "[{}] state changed: {} -> {}", self.instance_id, old, new)
            }
        }
    }
}
