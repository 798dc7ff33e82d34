use std::{
    fmt::{self, Display},
    io::ErrorKind,
    net::{TcpListener, UdpSocket},
};

use crate::{config::InstanceConfig, error::LaunchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortClass {
    Game,
    Query,
    Rcon,
}

impl Display for PortClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Game => "game",
            Self::Query => "query",
            Self::Rcon => "rcon",
        };
        write!(f, "{}", s)
    }
}

/// Probes every distinct port the instance will bind. Read-only; the probe
/// sockets are dropped immediately. Must pass before anything is spawned.
pub fn validate_ports(config: &InstanceConfig) -> Result<(), LaunchError> {
    probe_udp(PortClass::Game, config.game_port)?;
    // The query listener shares the game socket when the ports collide.
    if config.query_port != config.game_port {
        probe_udp(PortClass::Query, config.query_port)?;
    }
    if config.rcon_enabled {
        probe_tcp(PortClass::Rcon, config.rcon_port)?;
    }
    Ok(())
}

fn probe_udp(class: PortClass, port: u16) -> Result<(), LaunchError> {
    match UdpSocket::bind(("0.0.0.0", port)) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AddrInUse => Err(LaunchError::PortInUse { class, port }),
        Err(e) => Err(LaunchError::PortProbe {
            class,
            port,
            reason: e.to_string(),
        }),
    }
}

fn probe_tcp(class: PortClass, port: u16) -> Result<(), LaunchError> {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AddrInUse => Err(LaunchError::PortInUse { class, port }),
        Err(e) => Err(LaunchError::PortProbe {
            class,
            port,
            reason: e.to_string(),
        }),
    }
}
