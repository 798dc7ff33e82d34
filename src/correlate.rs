//! Attributes log files in the shared log directory to the instances that
//! write them. Every instance's server process logs into the same
//! directory and nothing else reports which file belongs to whom, so
//! ownership is established heuristically after launch and held in a
//! registry that never hands a claimed file to a second instance.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{config::DetectPolicy, instance::InstanceId};

/// Matches `ShooterGame.log` and `ShooterGame_<n>.log`. Backup copies are
/// never live logs.
pub fn is_server_log_name(name: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^ShooterGame(_\d+)?\.log$").unwrap());
    if name.to_ascii_lowercase().contains("backup") {
        return false;
    }
    re.is_match(name)
}

/// Enumerates the recognized log files currently in `dir`, sorted by name.
/// A missing directory reads as empty.
pub async fn list_log_files(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return found;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_server_log_name(name) {
            found.push(entry.path());
        }
    }
    found.sort();
    found
}

/// Ownership table mapping instances to the log file they write. At most
/// one instance may own a path at a time.
#[derive(Debug, Default)]
pub struct LogRegistry {
    claims: Mutex<HashMap<InstanceId, PathBuf>>,
}

impl LogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `path` for `instance_id`. Refused when another live
    /// registration already owns the path; re-claiming one's own path is
    /// fine.
    pub async fn claim(&self, instance_id: &InstanceId, path: &Path) -> bool {
        let mut claims = self.claims.lock().await;
        if claims
            .iter()
            .any(|(owner, owned)| owned == path && owner != instance_id)
        {
            return false;
        }
        claims.insert(instance_id.clone(), path.to_path_buf());
        true
    }

    pub async fn release(&self, instance_id: &InstanceId) -> Option<PathBuf> {
        self.claims.lock().await.remove(instance_id)
    }

    pub async fn path_for(&self, instance_id: &InstanceId) -> Option<PathBuf> {
        self.claims.lock().await.get(instance_id).cloned()
    }

    pub async fn is_claimed_by_other(&self, path: &Path, instance_id: &InstanceId) -> bool {
        self.claims
            .lock()
            .await
            .iter()
            .any(|(owner, owned)| owned == path && owner != instance_id)
    }

    pub async fn clear(&self) {
        self.claims.lock().await.clear();
    }

    pub async fn is_empty(&self) -> bool {
        self.claims.lock().await.is_empty()
    }
}

/// Runs the retried post-launch detection loop for one instance and claims
/// the file it settles on. Returns `None` when cancelled or when the
/// attempt budget runs out; the instance keeps running either way, just
/// without live log streaming.
pub async fn detect_log_file(
    log_dir: &Path,
    instance_id: &InstanceId,
    session_name: &str,
    snapshot: &HashSet<PathBuf>,
    registry: &LogRegistry,
    policy: &DetectPolicy,
    cancel: &CancellationToken,
) -> Option<PathBuf> {
    tokio::select! {
        _ = cancel.cancelled() => return None,
        _ = tokio::time::sleep(policy.grace) => {}
    }

    for attempt in 1..=policy.attempts {
        if cancel.is_cancelled() {
            return None;
        }

        let current = list_log_files(log_dir).await;
        let new_files: Vec<PathBuf> = current
            .iter()
            .filter(|path| !snapshot.contains(*path))
            .cloned()
            .collect();

        if let Some(path) =
            try_claim(&current, &new_files, instance_id, session_name, registry).await
        {
            // The claim may have raced a stop request; never leave a
            // registration behind for a cancelled instance.
            if cancel.is_cancelled() {
                registry.release(instance_id).await;
                return None;
            }
            info!(instance = %instance_id, path = %path.display(), "log file attributed");
            return Some(path);
        }

        debug!(instance = %instance_id, attempt, "log file not attributed yet");
        if attempt < policy.attempts {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(policy.interval) => {}
            }
        }
    }

    warn!(
        instance = %instance_id,
        "log file detection gave up; live log streaming unavailable for this run"
    );
    None
}

async fn try_claim(
    current: &[PathBuf],
    new_files: &[PathBuf],
    instance_id: &InstanceId,
    session_name: &str,
    registry: &LogRegistry,
) -> Option<PathBuf> {
    // Exactly one file the pre-launch snapshot did not have.
    if new_files.len() == 1 {
        let path = &new_files[0];
        if registry.claim(instance_id, path).await {
            debug!(instance = %instance_id, "attributed the single new log file");
            return Some(path.clone());
        }
    }

    // Content match on the session name. A file owned by another instance
    // is skipped even when its content matches.
    let marker = format!("SessionName={}", session_name);
    for path in current {
        if registry.is_claimed_by_other(path, instance_id).await {
            continue;
        }
        let Ok(bytes) = tokio::fs::read(path).await else {
            continue;
        };
        let content = String::from_utf8_lossy(&bytes);
        if content.contains(&marker) || contains_token(&content, session_name) {
            if registry.claim(instance_id, path).await {
                debug!(instance = %instance_id, "attributed log file by session name content");
                return Some(path.clone());
            }
        }
    }

    // Several new files and no content evidence: take the first one nobody
    // else owns.
    for path in new_files {
        if registry.claim(instance_id, path).await {
            debug!(instance = %instance_id, "attributed first unclaimed new log file");
            return Some(path.clone());
        }
    }

    None
}

fn contains_token(content: &str, token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    content.match_indices(token).any(|(start, _)| {
        let before = content[..start].chars().next_back();
        let after = content[start + token.len()..].chars().next();
        !before.is_some_and(|c| c.is_alphanumeric()) && !after.is_some_and(|c| c.is_alphanumeric())
    })
}
