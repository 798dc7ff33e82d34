use std::{collections::VecDeque, path::PathBuf};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TailPolicy;

/// Bounded ring of recent log lines backing history queries.
#[derive(Debug)]
pub(crate) struct LogBuffer {
    cap: usize,
    lines: VecDeque<String>,
}

impl LogBuffer {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            cap,
            lines: VecDeque::new(),
        }
    }

    pub(crate) fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.cap {
            self.lines.pop_front();
        }
    }

    pub(crate) fn recent(&self, max: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(max);
        self.lines.iter().skip(start).cloned().collect()
    }
}

/// Progress marker for one tailed file: how many lines have been seen and a
/// trailing window of them for the appended-content diff.
#[derive(Debug)]
pub struct TailCursor {
    total: usize,
    window: Vec<String>,
    cap: usize,
}

impl TailCursor {
    pub fn new(cap: usize) -> Self {
        Self {
            total: 0,
            window: Vec::new(),
            cap: cap.max(1),
        }
    }

    /// Feeds the file's current lines and returns only the ones not emitted
    /// before. Re-reads with no new content return nothing; a shrunken file
    /// resets the cursor and re-emits from the top.
    pub fn advance(&mut self, lines: &[String]) -> Vec<String> {
        let prev_total = self.total;
        let start = if lines.len() < prev_total {
            0
        } else {
            let w = self.window.len().min(prev_total);
            let base = prev_total - w;
            let mut i = 0;
            while i < w && lines[base + i] == self.window[i] {
                i += 1;
            }
            if i == w { prev_total } else { base + i }
        };

        let fresh = lines[start..].to_vec();
        self.total = lines.len();
        let keep = lines.len().min(self.cap);
        self.window = lines[lines.len() - keep..].to_vec();
        fresh
    }
}

/// Detaches the file watch when the instance stops. Disposal is idempotent
/// and safe even if the watch never produced anything.
#[derive(Debug)]
pub struct TailGuard {
    cancel: CancellationToken,
}

impl TailGuard {
    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Starts watching a log file and sends newly appended lines, in order, to
/// `tx`. Transient read failures are skipped; the next poll retries.
pub fn spawn_tailer(
    path: PathBuf,
    policy: TailPolicy,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<String>,
) -> TailGuard {
    let guard = TailGuard {
        cancel: cancel.clone(),
    };

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(policy.poll_interval);
        let mut cursor = TailCursor::new(policy.window_lines);
        let mut last_len: Option<u64> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let len = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(_) => continue,
            };
            if last_len == Some(len) {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            last_len = Some(len);

            let text = String::from_utf8_lossy(&bytes);
            let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
            // Hold back a line still being written; it is emitted complete.
            if !text.is_empty() && !text.ends_with('\n') {
                lines.pop();
            }

            for line in cursor.advance(&lines) {
                if cancel.is_cancelled() {
                    return;
                }
                if tx.send(line).is_err() {
                    return;
                }
            }
        }

        debug!(path = %path.display(), "tail watch detached");
    });

    guard
}
