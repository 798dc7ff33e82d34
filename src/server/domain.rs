use std::{collections::HashMap, path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::{
    cleanup,
    config::{EnginePolicies, InstanceConfig, ProtonSettings, stream::InstanceEvent},
    correlate::LogRegistry,
    error::{LaunchError, ServerError, SubscribeError},
    instance::{InstanceHandle, InstanceId, InstanceStatus},
};

/// Engine-level settings: where the server lives on disk and how foreign
/// binaries are translated. Persisted by the host tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArkGuardConfig {
    pub install_dir: PathBuf,
    #[serde(default)]
    pub server_exe: Option<PathBuf>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub proton: ProtonSettings,
}

impl ArkGuardConfig {
    pub fn new(install_dir: PathBuf) -> Self {
        Self {
            install_dir,
            server_exe: None,
            log_dir: None,
            proton: ProtonSettings::default(),
        }
    }

    pub fn server_exe_path(&self) -> PathBuf {
        self.server_exe.clone().unwrap_or_else(|| {
            self.install_dir
                .join("ShooterGame/Binaries/Win64/ArkAscendedServer.exe")
        })
    }

    /// The log directory every instance on this install shares.
    pub fn log_dir_path(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.install_dir.join("ShooterGame/Saved/Logs"))
    }
}

/// Owns every per-instance table: process handles, log file ownership and
/// the aggregate event bus. All instance state is reached through
/// id-scoped accessors on this one object.
#[derive(Debug)]
pub struct ArkGuardManager {
    config: ArkGuardConfig,
    policies: EnginePolicies,
    instances: RwLock<HashMap<InstanceId, InstanceHandle>>,
    registry: Arc<LogRegistry>,
    events_tx: broadcast::Sender<InstanceEvent>,
}

impl ArkGuardManager {
    pub fn new(config: ArkGuardConfig) -> Self {
        Self::with_policies(config, EnginePolicies::default())
    }

    pub fn with_policies(config: ArkGuardConfig, policies: EnginePolicies) -> Self {
        Self {
            config,
            policies,
            instances: RwLock::new(HashMap::new()),
            registry: Arc::new(LogRegistry::new()),
            events_tx: broadcast::Sender::new(2048),
        }
    }

    /// Launches an instance. A live handle under the same id is a caller
    /// bug; a finished one is replaced so the new run starts from a fresh
    /// snapshot and detection cycle.
    pub async fn start_instance(&self, config: InstanceConfig) -> Result<(), LaunchError> {
        let id = config.instance_id.clone();
        let mut instances = self.instances.write().await;
        if let Some(existing) = instances.get(&id) {
            if existing.status().await.is_live() {
                return Err(LaunchError::AlreadyRunning);
            }
        }

        let mut handle = InstanceHandle::new(
            config,
            self.config.server_exe_path(),
            self.config.log_dir_path(),
            self.config.proton.clone(),
            self.policies.clone(),
            self.registry.clone(),
            Some(self.events_tx.clone()),
        );
        let result = handle.start().await;
        // Failed launches stay queryable: the handle records the error
        // state.
        instances.insert(id, handle);
        result
    }

    pub async fn stop_instance(&self, instance_id: &InstanceId) -> Result<(), ServerError> {
        let mut instances = self.instances.write().await;
        let handle = instances
            .get_mut(instance_id)
            .ok_or_else(|| ServerError::UnknownInstance(instance_id.to_string()))?;
        handle.stop().await
    }

    /// Best-effort shutdown of everything. Individual failures are logged
    /// and never keep the rest of the batch from being processed; both
    /// tables end up empty regardless.
    pub async fn stop_all(&self) {
        let mut instances = self.instances.write().await;
        for (id, handle) in instances.iter_mut() {
            if let Err(e) = handle.stop().await {
                debug!(instance = %id, error = %e, "instance skipped during shutdown");
            }
        }
        instances.clear();
        self.registry.clear().await;
    }

    /// Lifecycle state for an instance; unknown ids read as stopped.
    pub async fn state(&self, instance_id: &InstanceId) -> InstanceStatus {
        match self.instances.read().await.get(instance_id) {
            Some(handle) => handle.status().await,
            None => InstanceStatus::Stopped,
        }
    }

    pub async fn recent_log_lines(&self, instance_id: &InstanceId, max: usize) -> Vec<String> {
        match self.instances.read().await.get(instance_id) {
            Some(handle) => handle.recent_lines(max).await,
            None => Vec::new(),
        }
    }

    /// The log file currently attributed to an instance, if detection has
    /// resolved one.
    pub async fn log_path(&self, instance_id: &InstanceId) -> Option<PathBuf> {
        self.registry.path_for(instance_id).await
    }

    /// Per-instance event stream: log lines and state changes.
    pub async fn subscribe(
        &self,
        instance_id: &InstanceId,
    ) -> Result<BroadcastStream<InstanceEvent>, SubscribeError> {
        match self.instances.read().await.get(instance_id) {
            Some(handle) => Ok(handle.subscribe()),
            None => Err(SubscribeError::UnknownInstance(instance_id.to_string())),
        }
    }

    /// Aggregate stream over every instance, for transports that want one
    /// channel.
    pub fn subscribe_all(&self) -> BroadcastStream<InstanceEvent> {
        BroadcastStream::new(self.events_tx.subscribe())
    }

    /// Startup-time sweep for processes a crashed host run left behind.
    pub async fn orphan_sweep(&self) {
        let mut patterns: Vec<String> = Vec::new();
        #[cfg(unix)]
        if let Some(root) = &self.config.proton.prefix_root {
            patterns.push(root.display().to_string());
        }
        cleanup::orphan_sweep(&patterns).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{CleanupPolicy, DetectPolicy, TailPolicy};
    use std::{path::Path, time::Duration};
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    fn fake_server(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-server.sh");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
        path
    }

    fn manager_for(root: &Path) -> ArkGuardManager {
        let log_dir = root.join("logs");
        std::fs::create_dir_all(&log_dir).expect("log dir");
        let mut config = ArkGuardConfig::new(root.to_path_buf());
        config.server_exe = Some(fake_server(root));
        config.log_dir = Some(log_dir);

        let policies = EnginePolicies {
            detect: DetectPolicy {
                grace: Duration::from_millis(10),
                interval: Duration::from_millis(20),
                attempts: 100,
            },
            tail: TailPolicy {
                poll_interval: Duration::from_millis(10),
                window_lines: 64,
                buffer_lines: 64,
            },
            cleanup: CleanupPolicy {
                kill_grace: Duration::from_millis(300),
            },
        };
        ArkGuardManager::with_policies(config, policies)
    }

    fn instance(id: &str, session: &str, port_base: u16) -> InstanceConfig {
        let mut config = InstanceConfig::new(InstanceId::from(id), session);
        config.game_port = port_base;
        config.query_port = port_base + 1;
        config.rcon_port = port_base + 2;
        config
    }

    async fn append(path: &Path, content: &str) {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .expect("open log");
        file.write_all(content.as_bytes()).await.expect("append");
    }

    async fn wait_for_state(manager: &ArkGuardManager, id: &InstanceId, want: InstanceStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if manager.state(id).await == want {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {want}, at {}",
                manager.state(id).await
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_for_log_path(manager: &ArkGuardManager, id: &InstanceId) -> PathBuf {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(path) = manager.log_path(id).await {
                return path;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for log attribution"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn lifecycle_runs_through_markers_and_stop() {
        let dir = tempdir().expect("tempdir");
        let manager = manager_for(dir.path());
        let id = InstanceId::from("alpha");

        manager
            .start_instance(instance("alpha", "MgrCycle", 17710))
            .await
            .expect("start");
        assert_eq!(manager.state(&id).await, InstanceStatus::Starting);

        let log = dir.path().join("logs/ShooterGame.log");
        append(&log, "[2025.08.04-12.00.00:000][  0]LogInit: booting\n").await;
        wait_for_log_path(&manager, &id).await;

        append(
            &log,
            "[2025.08.04-12.00.05:000][  7]Server: \"MgrCycle\" has successfully started and is now advertising for join.\n",
        )
        .await;
        wait_for_state(&manager, &id, InstanceStatus::Running).await;

        let recent = manager.recent_log_lines(&id, 10).await;
        assert!(recent.iter().any(|l| l.contains("advertising for join")));

        manager.stop_instance(&id).await.expect("stop");
        wait_for_state(&manager, &id, InstanceStatus::Stopped).await;
        assert!(manager.log_path(&id).await.is_none());
    }

    #[tokio::test]
    async fn starting_a_live_instance_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let manager = manager_for(dir.path());
        let id = InstanceId::from("alpha");

        manager
            .start_instance(instance("alpha", "MgrDouble", 17720))
            .await
            .expect("start");
        assert!(matches!(
            manager
                .start_instance(instance("alpha", "MgrDouble", 17720))
                .await,
            Err(LaunchError::AlreadyRunning)
        ));

        manager.stop_instance(&id).await.expect("stop");
        wait_for_state(&manager, &id, InstanceStatus::Stopped).await;
    }

    #[tokio::test]
    async fn two_instances_share_the_log_directory_without_mixups() {
        use crate::config::stream::EventPayload;
        use tokio_stream::StreamExt;

        let dir = tempdir().expect("tempdir");
        let manager = manager_for(dir.path());
        let a = InstanceId::from("a");
        let b = InstanceId::from("b");

        // One unrelated file predates both launches; each server has
        // already written its session banner, so content decides.
        let stale = dir.path().join("logs/ShooterGame.log");
        append(&stale, "SessionName=Old\n").await;
        let log_a = dir.path().join("logs/ShooterGame_1.log");
        let log_b = dir.path().join("logs/ShooterGame_2.log");
        append(&log_a, "[2025.08.04-12.00.00:000][  0]SessionName=MgrAlpha\n").await;
        append(&log_b, "[2025.08.04-12.00.00:000][  0]SessionName=MgrBeta\n").await;

        manager
            .start_instance(instance("a", "MgrAlpha", 17730))
            .await
            .expect("start a");
        manager
            .start_instance(instance("b", "MgrBeta", 17740))
            .await
            .expect("start b");

        let path_a = wait_for_log_path(&manager, &a).await;
        let path_b = wait_for_log_path(&manager, &b).await;
        assert_ne!(path_a, path_b);
        assert_ne!(path_a, stale);
        assert_ne!(path_b, stale);

        // Lines tagged for instance a never carry b's content.
        let mut events_a = manager.subscribe(&a).await.expect("subscribe");
        append(&log_a, "only alpha content\n").await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout_at(deadline, events_a.next())
                .await
                .expect("event in time")
                .expect("stream open")
                .expect("no lag");
            assert_eq!(event.instance_id, a);
            if let EventPayload::StdLine { line } = &event.payload {
                assert!(!line.msg().contains("MgrBeta"));
                if line.msg().contains("only alpha content") {
                    break;
                }
            }
        }

        manager.stop_all().await;
        assert!(manager.log_path(&a).await.is_none());
        assert!(manager.log_path(&b).await.is_none());
    }

    #[tokio::test]
    async fn stop_all_empties_every_table() {
        let dir = tempdir().expect("tempdir");
        let manager = manager_for(dir.path());

        let log_a = dir.path().join("logs/ShooterGame_1.log");
        let log_b = dir.path().join("logs/ShooterGame_2.log");
        append(&log_a, "SessionName=MgrSweepA\n").await;
        append(&log_b, "SessionName=MgrSweepB\n").await;

        manager
            .start_instance(instance("a", "MgrSweepA", 17750))
            .await
            .expect("start a");
        manager
            .start_instance(instance("b", "MgrSweepB", 17760))
            .await
            .expect("start b");

        wait_for_log_path(&manager, &InstanceId::from("a")).await;
        wait_for_log_path(&manager, &InstanceId::from("b")).await;

        manager.stop_all().await;
        assert_eq!(
            manager.state(&InstanceId::from("a")).await,
            InstanceStatus::Stopped
        );
        assert_eq!(
            manager.state(&InstanceId::from("b")).await,
            InstanceStatus::Stopped
        );
        assert!(manager.log_path(&InstanceId::from("a")).await.is_none());
        assert!(manager.log_path(&InstanceId::from("b")).await.is_none());
    }

    #[tokio::test]
    async fn restart_reattributes_instead_of_reusing_the_old_file() {
        let dir = tempdir().expect("tempdir");
        let manager = manager_for(dir.path());
        let id = InstanceId::from("alpha");

        manager
            .start_instance(instance("alpha", "MgrRestart", 17770))
            .await
            .expect("first start");
        let first_log = dir.path().join("logs/ShooterGame.log");
        append(&first_log, "SessionName=MgrRestart\n").await;
        let first = wait_for_log_path(&manager, &id).await;

        manager.stop_instance(&id).await.expect("stop");
        wait_for_state(&manager, &id, InstanceStatus::Stopped).await;
        assert!(manager.log_path(&id).await.is_none());

        // The server renames its previous log away on the next boot.
        tokio::fs::remove_file(&first_log).await.expect("rotate");

        manager
            .start_instance(instance("alpha", "MgrRestart", 17770))
            .await
            .expect("second start");
        let second_log = dir.path().join("logs/ShooterGame_1.log");
        append(&second_log, "[2025.08.04-13.00.00:000][  0]LogInit: booting\n").await;

        let second = wait_for_log_path(&manager, &id).await;
        assert_ne!(first, second);
        assert_eq!(second, second_log);

        manager.stop_instance(&id).await.expect("stop again");
        wait_for_state(&manager, &id, InstanceStatus::Stopped).await;
    }

    #[tokio::test]
    async fn exhausted_detection_leaves_the_instance_live() {
        let dir = tempdir().expect("tempdir");
        let log_dir = dir.path().join("logs");
        std::fs::create_dir_all(&log_dir).expect("log dir");
        let mut config = ArkGuardConfig::new(dir.path().to_path_buf());
        config.server_exe = Some(fake_server(dir.path()));
        config.log_dir = Some(log_dir);

        let policies = EnginePolicies {
            detect: DetectPolicy {
                grace: Duration::from_millis(5),
                interval: Duration::from_millis(10),
                attempts: 2,
            },
            tail: TailPolicy::default(),
            cleanup: CleanupPolicy {
                kill_grace: Duration::from_millis(300),
            },
        };
        let manager = ArkGuardManager::with_policies(config, policies);
        let id = InstanceId::from("alpha");

        // No log file ever appears; detection runs out of attempts.
        manager
            .start_instance(instance("alpha", "MgrNoLog", 17790))
            .await
            .expect("start");
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(manager.state(&id).await, InstanceStatus::Starting);
        assert!(manager.log_path(&id).await.is_none());
        assert!(manager.recent_log_lines(&id, 100).await.is_empty());

        manager.stop_instance(&id).await.expect("stop");
        wait_for_state(&manager, &id, InstanceStatus::Stopped).await;
    }

    #[tokio::test]
    async fn failed_launch_is_queryable_as_error() {
        let dir = tempdir().expect("tempdir");
        let log_dir = dir.path().join("logs");
        std::fs::create_dir_all(&log_dir).expect("log dir");
        let mut config = ArkGuardConfig::new(dir.path().to_path_buf());
        config.server_exe = Some(dir.path().join("missing-server"));
        config.log_dir = Some(log_dir);
        let manager = ArkGuardManager::new(config);

        let id = InstanceId::from("alpha");
        assert!(matches!(
            manager
                .start_instance(instance("alpha", "MgrBroken", 17780))
                .await,
            Err(LaunchError::MissingExecutable(_))
        ));
        assert_eq!(manager.state(&id).await, InstanceStatus::Error);
    }

    #[test]
    fn default_paths_derive_from_the_install_dir() {
        let config = ArkGuardConfig::new(PathBuf::from("/srv/asa"));
        assert_eq!(
            config.server_exe_path(),
            PathBuf::from("/srv/asa/ShooterGame/Binaries/Win64/ArkAscendedServer.exe")
        );
        assert_eq!(
            config.log_dir_path(),
            PathBuf::from("/srv/asa/ShooterGame/Saved/Logs")
        );
    }
}
