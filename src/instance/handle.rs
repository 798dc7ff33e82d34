use std::{collections::HashSet, path::PathBuf, process::Stdio, sync::Arc};

use tokio::{
    process::{self, Child},
    sync::{Mutex, RwLock, broadcast, mpsc, watch},
};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cleanup,
    config::{
        EnginePolicies, InstanceConfig, ProtonSettings,
        stream::{InstanceEvent, InternalEvent},
    },
    correlate::{self, LogRegistry},
    error::{LaunchError, ServerError},
    parser, ports,
    proton::{self, SpawnSpec},
    tail::{self, LogBuffer, TailGuard},
};

use super::{InstanceId, InstanceStatus};

/// State shared between the handle and its background tasks (exit watch,
/// log detection, tail consumer).
#[derive(Debug)]
pub(crate) struct InstanceShared {
    pub(crate) instance_id: InstanceId,
    status: RwLock<InstanceStatus>,
    events_tx: broadcast::Sender<InstanceEvent>,
    forward_tx: Option<broadcast::Sender<InstanceEvent>>,
    buffer: Mutex<LogBuffer>,
    tail_guard: Mutex<Option<TailGuard>>,
}

impl InstanceShared {
    pub(crate) async fn status(&self) -> InstanceStatus {
        *self.status.read().await
    }

    /// The only mutation path for lifecycle state. Applies the transition
    /// if it is legal and announces it exactly once; illegal or repeated
    /// transitions are ignored.
    pub(crate) async fn transition(&self, next: InstanceStatus) -> bool {
        let mut status = self.status.write().await;
        let old = *status;
        if !old.can_transition(next) {
            return false;
        }
        *status = next;
        drop(status);

        debug!(instance = %self.instance_id, from = %old, to = %next, "state transition");
        self.send(InstanceEvent::state_change(
            self.instance_id.clone(),
            old,
            next,
        ));
        true
    }

    async fn push_line(&self, line: String) {
        self.buffer.lock().await.push_line(line.clone());
        self.send(InstanceEvent::log_line(self.instance_id.clone(), line));
    }

    fn send(&self, event: InstanceEvent) {
        let _ = self.events_tx.send(event.clone());
        if let Some(forward) = &self.forward_tx {
            let _ = forward.send(event);
        }
    }
}

/// One launch of one configured instance. A handle drives at most one
/// process for its lifetime; a restart gets a fresh handle so that log
/// detection always starts from a clean snapshot.
#[derive(Debug)]
pub struct InstanceHandle {
    pub config: InstanceConfig,
    server_exe: PathBuf,
    log_dir: PathBuf,
    proton: ProtonSettings,
    policies: EnginePolicies,
    registry: Arc<LogRegistry>,
    shared: Arc<InstanceShared>,
    cancel: CancellationToken,
    pid: Option<u32>,
    kill_tx: Option<mpsc::Sender<()>>,
    exit_rx: Option<watch::Receiver<bool>>,
    started: bool,
}

impl InstanceHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: InstanceConfig,
        server_exe: PathBuf,
        log_dir: PathBuf,
        proton: ProtonSettings,
        policies: EnginePolicies,
        registry: Arc<LogRegistry>,
        forward_tx: Option<broadcast::Sender<InstanceEvent>>,
    ) -> Self {
        let shared = Arc::new(InstanceShared {
            instance_id: config.instance_id.clone(),
            status: RwLock::new(InstanceStatus::Stopped),
            events_tx: broadcast::Sender::new(2048),
            forward_tx,
            buffer: Mutex::new(LogBuffer::new(policies.tail.buffer_lines)),
            tail_guard: Mutex::new(None),
        });

        Self {
            config,
            server_exe,
            log_dir,
            proton,
            policies,
            registry,
            shared,
            cancel: CancellationToken::new(),
            pid: None,
            kill_tx: None,
            exit_rx: None,
            started: false,
        }
    }

    pub async fn status(&self) -> InstanceStatus {
        self.shared.status().await
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn subscribe(&self) -> BroadcastStream<InstanceEvent> {
        BroadcastStream::new(self.shared.events_tx.subscribe())
    }

    pub async fn recent_lines(&self, max: usize) -> Vec<String> {
        self.shared.buffer.lock().await.recent(max)
    }

    pub async fn log_path(&self) -> Option<PathBuf> {
        self.registry.path_for(&self.config.instance_id).await
    }

    /// Validates, spawns and wires up the instance. Returns as soon as the
    /// process is up; log detection and the ready transition happen in the
    /// background.
    pub async fn start(&mut self) -> Result<(), LaunchError> {
        if self.started {
            return Err(LaunchError::AlreadyRunning);
        }

        // A port conflict aborts before anything is spawned and leaves the
        // instance stopped.
        ports::validate_ports(&self.config)?;

        if !self.server_exe.exists() {
            self.shared.transition(InstanceStatus::Error).await;
            return Err(LaunchError::MissingExecutable(
                self.server_exe.display().to_string(),
            ));
        }

        let spec = match proton::build_spawn_spec(
            &self.server_exe,
            self.config.launch_args(),
            &self.config.instance_id,
            &self.proton,
        ) {
            Ok(spec) => spec,
            Err(e) => {
                self.shared.transition(InstanceStatus::Error).await;
                return Err(e);
            }
        };

        // Snapshot the shared log directory before the process can create
        // its file; detection works off the difference.
        let snapshot: HashSet<PathBuf> = correlate::list_log_files(&self.log_dir)
            .await
            .into_iter()
            .collect();

        let mut command = self.build_command(&spec);
        #[allow(unused_mut)]
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.shared.transition(InstanceStatus::Error).await;
                return Err(LaunchError::SpawnFailed(e.to_string()));
            }
        };

        self.started = true;
        self.pid = child.id();
        info!(instance = %self.config.instance_id, pid = ?self.pid, "server process spawned");

        #[cfg(windows)]
        self.pump_diagnostics(&mut child);

        self.shared.transition(InstanceStatus::Starting).await;

        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(false);
        self.kill_tx = Some(kill_tx);
        self.exit_rx = Some(exit_rx);

        self.spawn_exit_watch(child, kill_rx, exit_tx);
        self.spawn_detection(snapshot);
        Ok(())
    }

    fn build_command(&self, spec: &SpawnSpec) -> process::Command {
        let mut command = process::Command::new(&spec.command);
        command.args(&spec.args);
        command.env("_NO_DEBUG_HEAP", "1");
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        #[cfg(unix)]
        {
            // Detached: own process group, nothing inherited from the
            // host's console. The on-disk log is the canonical stream.
            command
                .process_group(0)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
        }
        #[cfg(windows)]
        {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }

        command
    }

    /// Stdio is diagnostic only; lines go to the host log, never to the
    /// instance event bus.
    #[cfg(windows)]
    fn pump_diagnostics(&self, child: &mut Child) {
        use tokio::io::{AsyncBufReadExt, BufReader};

        if let Some(stdout) = child.stdout.take() {
            let id = self.config.instance_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(instance = %id, "stdout: {line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let id = self.config.instance_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(instance = %id, "stderr: {line}");
                }
            });
        }
    }

    fn spawn_exit_watch(
        &self,
        mut child: Child,
        mut kill_rx: mpsc::Receiver<()>,
        exit_tx: watch::Sender<bool>,
    ) {
        let shared = self.shared.clone();
        let registry = self.registry.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = child.wait() => {
                        match res {
                            Ok(status) => {
                                info!(
                                    instance = %shared.instance_id,
                                    code = ?status.code(),
                                    "server process exited"
                                );
                                shared.transition(InstanceStatus::Stopped).await;
                            }
                            Err(e) => {
                                error!(
                                    instance = %shared.instance_id,
                                    error = %e,
                                    "server process failed"
                                );
                                shared.transition(InstanceStatus::Error).await;
                            }
                        }
                        break;
                    }
                    Some(()) = kill_rx.recv() => {
                        warn!(instance = %shared.instance_id, "killing server process");
                        let _ = child.start_kill();
                    }
                }
            }

            // The process is gone: stop detection and tailing, free the
            // log file for future runs.
            cancel.cancel();
            if let Some(guard) = shared.tail_guard.lock().await.take() {
                guard.dispose();
            }
            registry.release(&shared.instance_id).await;
            let _ = exit_tx.send(true);
        });
    }

    fn spawn_detection(&self, snapshot: HashSet<PathBuf>) {
        let shared = self.shared.clone();
        let registry = self.registry.clone();
        let cancel = self.cancel.clone();
        let policy = self.policies.detect.clone();
        let tail_policy = self.policies.tail.clone();
        let log_dir = self.log_dir.clone();
        let session_name = self.config.session_name.clone();

        tokio::spawn(async move {
            let id = shared.instance_id.clone();
            let Some(path) = correlate::detect_log_file(
                &log_dir,
                &id,
                &session_name,
                &snapshot,
                &registry,
                &policy,
                &cancel,
            )
            .await
            else {
                return;
            };

            let (line_tx, mut line_rx) = mpsc::unbounded_channel();
            let guard = tail::spawn_tailer(path, tail_policy, cancel.child_token(), line_tx);
            *shared.tail_guard.lock().await = Some(guard);

            // Every tailed line feeds history, the event bus and the
            // lifecycle markers.
            while let Some(line) = line_rx.recv().await {
                match parser::scan_line(&line) {
                    Some(InternalEvent::ServerAdvertising) => {
                        shared.transition(InstanceStatus::Running).await;
                    }
                    Some(InternalEvent::ServerClosing) => {
                        shared.transition(InstanceStatus::Stopping).await;
                    }
                    None => {}
                }
                shared.push_line(line).await;
            }
        });
    }

    /// Graceful shutdown with forced-kill escalation. Returns immediately
    /// after signalling; the exit watch records the actual exit.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        if !self.shared.status().await.is_live() {
            return Err(ServerError::NotRunning);
        }
        self.shared.transition(InstanceStatus::Stopping).await;

        // Pending detection retries must not fire after deregistration,
        // and the tail watch goes quiet now.
        self.cancel.cancel();
        if let Some(guard) = self.shared.tail_guard.lock().await.take() {
            guard.dispose();
        }
        self.registry.release(&self.config.instance_id).await;

        let Some(pid) = self.pid else {
            return Err(ServerError::NotRunning);
        };
        if let Err(e) = cleanup::signal_graceful(pid).await {
            warn!(instance = %self.config.instance_id, error = %e, "graceful signal rejected");
        }
        if let (Some(kill_tx), Some(exit_rx)) = (self.kill_tx.clone(), self.exit_rx.clone()) {
            cleanup::spawn_forced_kill(kill_tx, exit_rx, self.policies.cleanup.kill_grace);
        }

        #[cfg(unix)]
        {
            let marker = format!("SessionName={}", self.config.session_name);
            let prefix = proton::instance_prefix(&self.proton, &self.config.instance_id);
            cleanup::sweep_instance_helpers(&[marker, prefix.display().to_string()]).await;
        }

        Ok(())
    }
}
