// src/tailer.rs

//! Follows an [`OutputSink`](crate::sink::OutputSink) while it is being
//! written and hands each completed line to a callback.
//!
//! The loop runs on tokio's blocking pool: both the positional file reads and
//! the caller's callback may block, and neither may hold up the executor that
//! drives the watchdog.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::sink::SinkView;

/// Callback invoked once per completed output line.
pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Pause between polls that found nothing new.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How long the final drain may keep delivering lines after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on how long `stop` waits for the loop to return. Leaves room
/// for one callback that was already running when the drain deadline passed.
const JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Handle to a running tailer.
///
/// Call [`LineTailer::stop`] to drain and join it. Dropping the handle
/// without stopping signals shutdown; the loop then finishes its drain on
/// its own.
pub struct LineTailer {
    shutdown: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl LineTailer {
    /// Starts tailing `view` from its first byte. Must be called from within
    /// a tokio runtime.
    pub fn spawn(view: SinkView, on_line: LineCallback) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let task = tokio::task::spawn_blocking(move || tail_loop(view, on_line, &flag));
        Self {
            shutdown,
            task: Some(task),
        }
    }

    /// Signals shutdown and waits for the loop to deliver whatever complete
    /// lines are already in the sink.
    pub async fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        let Some(task) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(JOIN_TIMEOUT, task).await {
            Ok(Ok(())) => debug!("Line tailer stopped"),
            Ok(Err(e)) if e.is_panic() => warn!("Line callback panicked; tailing ended early"),
            Ok(Err(e)) => warn!(error = %e, "Line tailer ended abnormally"),
            Err(_) => {
                // A blocking task cannot be aborted; the shutdown flag ends it
                // once the stuck callback returns.
                warn!(timeout = ?JOIN_TIMEOUT, "Line callback still running, detaching line tailer");
            }
        }
    }
}

impl Drop for LineTailer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

fn tail_loop(view: SinkView, on_line: LineCallback, shutdown: &AtomicBool) {
    let mut splitter = LineSplitter::default();
    let mut cursor = 0u64;
    // Starts counting the first time it is consulted after shutdown, which may
    // be in the middle of a batch.
    let drain_deadline: Cell<Option<Instant>> = Cell::new(None);
    let expired = || {
        if !shutdown.load(Ordering::Acquire) {
            return false;
        }
        let deadline = drain_deadline.get().unwrap_or_else(|| {
            let deadline = Instant::now() + DRAIN_TIMEOUT;
            drain_deadline.set(Some(deadline));
            deadline
        });
        Instant::now() >= deadline
    };

    loop {
        // Checked before reading so the reads that follow a shutdown are the
        // final drain.
        let stopping = shutdown.load(Ordering::Acquire);

        match view.read_from(cursor) {
            Ok((bytes, next)) => {
                cursor = next;
                if !bytes.is_empty() {
                    let delivered = splitter.push(&bytes, |line| {
                        if expired() {
                            return false;
                        }
                        on_line(line);
                        true
                    });
                    if !delivered {
                        warn!(timeout = ?DRAIN_TIMEOUT, "Output drain took too long, remaining lines dropped");
                        return;
                    }
                    if stopping && expired() {
                        debug!("Output still growing at drain deadline, stopping line tailer");
                        return;
                    }
                    // Reads are bounded, so keep going until one comes back empty.
                    continue;
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed reading captured output, stopping line tailer");
                return;
            }
        }

        if stopping {
            if splitter.pending() > 0 {
                debug!(bytes = splitter.pending(), "Dropping incomplete trailing line");
            }
            return;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Splits a byte stream into lines, carrying incomplete tails between pushes.
#[derive(Debug, Default)]
struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    /// Emits every completed line. Returns `false` as soon as `emit` does,
    /// leaving the rest of `bytes` unprocessed.
    fn push(&mut self, bytes: &[u8], mut emit: impl FnMut(&str) -> bool) -> bool {
        let mut rest = bytes;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            self.partial.extend_from_slice(head);
            if self.partial.last() == Some(&b'\r') {
                self.partial.pop();
            }
            if !emit(&*String::from_utf8_lossy(&self.partial)) {
                return false;
            }
            self.partial.clear();
            rest = &tail[1..];
        }
        self.partial.extend_from_slice(rest);
        true
    }

    fn pending(&self) -> usize {
        self.partial.len()
    }
}
