use thiserror::Error;

use crate::ports::PortClass;

#[derive(Debug, Clone, Error)]
pub enum LaunchError {
    #[error("Instance is already running")]
    AlreadyRunning,

    #[error("{class} port {port} is already in use")]
    PortInUse { class: PortClass, port: u16 },

    #[error("Failed to probe {class} port {port}: {reason}")]
    PortProbe {
        class: PortClass,
        port: u16,
        reason: String,
    },

    #[error("Server executable not found: {0}")]
    MissingExecutable(String),

    #[error("Proton runtime not found: {0}")]
    ProtonNotFound(String),

    #[error("Failed to prepare compatibility prefix: {0}")]
    PrefixSetup(String),

    #[error("Failed to spawn server process: {0}")]
    SpawnFailed(String),
}

#[derive(Debug, Clone, Error)]
pub enum ServerError {
    #[error("Unknown instance: {0}")]
    UnknownInstance(String),

    #[error("Instance is not running")]
    NotRunning,

    #[error("Failed to signal server process")]
    SignalFailed,
}

#[derive(Debug, Clone, Error)]
pub enum SubscribeError {
    #[error("Unknown instance: {0}")]
    UnknownInstance(String),
}
