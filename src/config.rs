use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::instance::InstanceId;

pub mod stream;

/// Launch configuration for one server instance. Owned and persisted by the
/// host tool; immutable input to a launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub instance_id: InstanceId,
    pub map_name: String,
    pub session_name: String,
    pub game_port: u16,
    pub query_port: u16,
    pub rcon_port: u16,
    pub rcon_enabled: bool,
    #[serde(default)]
    pub admin_password: Option<String>,
    pub max_players: u32,
    #[serde(default)]
    pub server_platform: Option<String>,
    #[serde(default)]
    pub mods: Vec<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub save_dir_name: Option<String>,
}

impl InstanceConfig {
    pub fn new<S: Into<String>>(instance_id: InstanceId, session_name: S) -> Self {
        Self {
            instance_id,
            map_name: "TheIsland_WP".to_string(),
            session_name: session_name.into(),
            game_port: 7777,
            query_port: 27015,
            rcon_port: 27020,
            rcon_enabled: false,
            admin_password: None,
            max_players: 70,
            server_platform: None,
            mods: Vec::new(),
            extra_args: Vec::new(),
            save_dir_name: None,
        }
    }

    /// Composes the full server argument list. The first argument is the
    /// `?`-joined map url, everything else is dash options.
    pub fn launch_args(&self) -> Vec<String> {
        let mut url = format!(
            "{}?listen?SessionName={}?Port={}?QueryPort={}",
            self.map_name, self.session_name, self.game_port, self.query_port
        );
        if self.rcon_enabled {
            url.push_str(&format!("?RCONEnabled=True?RCONPort={}", self.rcon_port));
        }
        if let Some(password) = &self.admin_password {
            url.push_str(&format!("?ServerAdminPassword={}", password));
        }

        let mut args = vec![url];
        args.push(format!("-WinLiveMaxPlayers={}", self.max_players));
        args.push("-servergamelog".to_string());
        if let Some(platform) = &self.server_platform {
            args.push(format!("-ServerPlatform={}", platform));
        }
        if !self.mods.is_empty() {
            args.push(format!("-mods={}", self.mods.join(",")));
        }
        if let Some(save_dir) = &self.save_dir_name {
            args.push(format!("-AltSaveDirectoryName={}", save_dir));
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Where the translation runtime lives on hosts that cannot run the server
/// binary natively. All fields optional; discovery falls back to the
/// `PROTON_PATH` environment variable and per-user data directories.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtonSettings {
    #[serde(default)]
    pub proton_bin: Option<PathBuf>,
    #[serde(default)]
    pub prefix_root: Option<PathBuf>,
    #[serde(default)]
    pub steam_client_dir: Option<PathBuf>,
}

/// Bounds for the post-launch log file detection loop.
#[derive(Debug, Clone)]
pub struct DetectPolicy {
    pub grace: Duration,
    pub interval: Duration,
    pub attempts: u32,
}

impl Default for DetectPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(3),
            interval: Duration::from_secs(2),
            attempts: 15,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TailPolicy {
    pub poll_interval: Duration,
    /// Trailing lines remembered for the appended-content diff.
    pub window_lines: usize,
    /// Recent lines retained for history queries.
    pub buffer_lines: usize,
}

impl Default for TailPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            window_lines: 256,
            buffer_lines: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CleanupPolicy {
    /// How long a graceful stop may take before the forced kill fires.
    pub kill_grace: Duration,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnginePolicies {
    pub detect: DetectPolicy,
    pub tail: TailPolicy,
    pub cleanup: CleanupPolicy,
}
