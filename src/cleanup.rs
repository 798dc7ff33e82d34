//! Terminates server processes and whatever they leave behind: graceful
//! signal first, forced kill after a grace window, and a startup sweep for
//! orphans surviving a crashed host run. Every kill here is best effort; a
//! refused signal is logged and never aborts the rest of a batch.

use std::time::Duration;

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::error::ServerError;

#[cfg(any(unix, windows))]
use tokio::process::Command;

/// Asks the process (and its group, where the platform has one) to shut
/// down. The whole group is signalled first so helper processes go with
/// the server; the individual pid is the fallback.
#[cfg(unix)]
pub(crate) async fn signal_graceful(pid: u32) -> Result<(), ServerError> {
    let pgid = pid as i32;
    let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(ServerError::SignalFailed)
    }
}

#[cfg(windows)]
pub(crate) async fn signal_graceful(pid: u32) -> Result<(), ServerError> {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .status()
        .await
        .map_err(|_| ServerError::SignalFailed)?;
    if status.success() {
        Ok(())
    } else {
        Err(ServerError::SignalFailed)
    }
}

/// Schedules the forced kill. Fires only if the exit watch has not seen the
/// process go down within `grace`; resolves to whether a kill was sent.
pub(crate) fn spawn_forced_kill(
    kill_tx: mpsc::Sender<()>,
    mut exit_rx: watch::Receiver<bool>,
    grace: Duration,
) -> JoinHandle<bool> {
    tokio::spawn(async move {
        let timed_out = wait_for_exit_or_timeout(&mut exit_rx, grace).await;
        if timed_out {
            warn!("grace window elapsed; forcing kill");
            let _ = kill_tx.send(()).await;
            true
        } else {
            debug!("process exited inside the grace window; no forced kill");
            false
        }
    })
}

/// Returns `true` once `grace` elapses without the exit watch reporting
/// completion, `false` if the process exits first.
async fn wait_for_exit_or_timeout(exit_rx: &mut watch::Receiver<bool>, grace: Duration) -> bool {
    tokio::time::timeout(grace, exit_rx.wait_for(|done| *done))
        .await
        .is_err()
}

/// Kills lingering virtual-display and translation-runtime helpers tied to
/// one instance, matched by instance-specific fragments of their command
/// lines.
#[cfg(unix)]
pub(crate) async fn sweep_instance_helpers(patterns: &[String]) {
    for pattern in patterns {
        run_pkill(pattern).await;
    }
}

#[cfg(unix)]
async fn run_pkill(pattern: &str) {
    // pkill exits 1 when nothing matched; that counts as a clean sweep.
    match Command::new("pkill").arg("-f").arg(pattern).status().await {
        Ok(status) => debug!(pattern, code = ?status.code(), "process sweep finished"),
        Err(e) => warn!(pattern, error = %e, "process sweep could not run"),
    }
}

/// Startup-time sweep for server and helper processes left behind by a
/// previous crashed run. Works purely off executable-name patterns; the
/// in-memory registry is empty at this point.
pub async fn orphan_sweep(extra_patterns: &[String]) {
    info!("sweeping for orphaned server processes");

    #[cfg(unix)]
    {
        run_pkill("ArkAscendedServer.exe").await;
        for pattern in extra_patterns {
            run_pkill(pattern).await;
        }
    }

    #[cfg(windows)]
    {
        let _ = extra_patterns;
        match Command::new("taskkill")
            .args(["/F", "/T", "/IM", "ArkAscendedServer.exe"])
            .status()
            .await
        {
            Ok(status) => debug!(code = ?status.code(), "orphan sweep finished"),
            Err(e) => warn!(error = %e, "orphan sweep could not run"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forced_kill_skipped_when_process_exits_in_time() {
        let (kill_tx, mut kill_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(false);

        let escalation = spawn_forced_kill(kill_tx, exit_rx, Duration::from_millis(300));
        tokio::time::sleep(Duration::from_millis(30)).await;
        exit_tx.send(true).expect("exit watch");

        assert!(!escalation.await.expect("escalation task"));
        assert!(kill_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forced_kill_fires_when_process_hangs() {
        let (kill_tx, mut kill_rx) = mpsc::channel(1);
        let (_exit_tx, exit_rx) = watch::channel(false);

        let escalation = spawn_forced_kill(kill_tx, exit_rx, Duration::from_millis(50));
        assert!(escalation.await.expect("escalation task"));
        assert!(kill_rx.recv().await.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn graceful_signal_terminates_a_process_group() {
        let mut child = Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .expect("spawn sleep");
        let pid = child.id().expect("pid");

        signal_graceful(pid).await.expect("signal");
        let status = tokio::time::timeout(Duration::from_secs(2), child.wait())
            .await
            .expect("exit in time")
            .expect("wait");
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signalling_a_dead_pid_is_an_error_not_a_panic() {
        // Spawn and reap a child so its pid is no longer valid.
        let mut child = Command::new("true").spawn().expect("spawn true");
        let pid = child.id().expect("pid");
        child.wait().await.expect("wait");

        // Either the pid is gone (error) or it was recycled; both are fine,
        // the point is that nothing panics.
        let _ = signal_graceful(pid).await;
    }

    #[tokio::test]
    async fn orphan_sweep_tolerates_no_matches() {
        orphan_sweep(&["arkguard-test-no-such-process".to_string()]).await;
    }
}
