use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::env;

#[cfg(unix)]
use tracing::{debug, warn};

use crate::{config::ProtonSettings, error::LaunchError, instance::InstanceId};

/// Fully resolved spawn description: what to exec, with which arguments and
/// which extra environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Turns an executable and its argument list into a spawnable command.
///
/// A binary the host can execute directly passes through unchanged. A
/// foreign-OS binary is wrapped in the Proton runtime under a virtual
/// display so it can run headless. Wrapping is deterministic and repeat
/// calls are safe; the only side effect is creating the prefix directory.
pub fn build_spawn_spec(
    exe: &Path,
    args: Vec<String>,
    instance_id: &InstanceId,
    settings: &ProtonSettings,
) -> Result<SpawnSpec, LaunchError> {
    #[cfg(unix)]
    {
        if needs_translation(exe) {
            return build_proton_spec(exe, args, instance_id, settings);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (instance_id, settings);
    }

    Ok(SpawnSpec {
        command: exe.to_path_buf(),
        args,
        env: Vec::new(),
    })
}

#[cfg(unix)]
fn needs_translation(exe: &Path) -> bool {
    exe.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
}

#[cfg(unix)]
fn build_proton_spec(
    exe: &Path,
    args: Vec<String>,
    instance_id: &InstanceId,
    settings: &ProtonSettings,
) -> Result<SpawnSpec, LaunchError> {
    let proton = find_proton(settings)?;
    let prefix = prefix_dir(settings, instance_id);
    std::fs::create_dir_all(&prefix).map_err(|e| LaunchError::PrefixSetup(e.to_string()))?;

    let steam_dir = settings
        .steam_client_dir
        .clone()
        .or_else(|| dirs::home_dir().map(|home| home.join(".steam/steam")))
        .unwrap_or_else(|| PathBuf::from("/usr/lib/steam"));

    let mut wrapped = vec![
        "-a".to_string(),
        proton.display().to_string(),
        "run".to_string(),
        exe.display().to_string(),
    ];
    wrapped.extend(args);

    debug!(instance = %instance_id, proton = %proton.display(), "wrapping launch in proton");

    Ok(SpawnSpec {
        command: PathBuf::from("xvfb-run"),
        args: wrapped,
        env: vec![
            (
                "STEAM_COMPAT_DATA_PATH".to_string(),
                prefix.display().to_string(),
            ),
            (
                "STEAM_COMPAT_CLIENT_INSTALL_PATH".to_string(),
                steam_dir.display().to_string(),
            ),
            ("WINEDEBUG".to_string(), "-all".to_string()),
        ],
    })
}

#[cfg(unix)]
fn find_proton(settings: &ProtonSettings) -> Result<PathBuf, LaunchError> {
    if let Some(configured) = &settings.proton_bin {
        if configured.exists() {
            return Ok(configured.clone());
        }
        warn!(path = %configured.display(), "configured proton path does not exist");
    }

    if let Ok(from_env) = env::var("PROTON_PATH") {
        let path = PathBuf::from(from_env);
        if path.exists() {
            return Ok(path);
        }
        warn!(path = %path.display(), "PROTON_PATH set but path does not exist");
    }

    Err(LaunchError::ProtonNotFound(
        "no proton runtime configured; install Proton and set the proton path or PROTON_PATH"
            .to_string(),
    ))
}

/// The per-instance compatibility prefix location, also consulted when
/// sweeping leftover helper processes.
#[cfg(unix)]
pub(crate) fn instance_prefix(settings: &ProtonSettings, instance_id: &InstanceId) -> PathBuf {
    prefix_dir(settings, instance_id)
}

#[cfg(unix)]
fn prefix_dir(settings: &ProtonSettings, instance_id: &InstanceId) -> PathBuf {
    let root = settings
        .prefix_root
        .clone()
        .or_else(|| dirs::data_dir().map(|data| data.join("arkguard").join("prefixes")))
        .unwrap_or_else(|| std::env::temp_dir().join("arkguard-prefixes"));
    root.join(&instance_id.0)
}
