//! Keepalive writer (C5): while the connection is otherwise idle, write a
//! single whitespace byte on a fixed interval to keep NATs and idle-timeout
//! proxies from dropping the connection.
//!
//! Runs as its own task so it never competes with application writes for
//! CPU time; it does compete with them for the writer lock, which is the
//! point: holding the lock while writing means a keepalive byte can never
//! land in the middle of a stanza.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use log::{debug, trace};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

/// Shared "a real stanza was just written" clock. `Connection::write_stanza`
/// (and the raw element writer it wraps) touch this on every outbound write;
/// the keepalive ticker checks it before sending its filler byte, so the
/// keepalive never fires on top of genuine traffic.
#[derive(Clone)]
pub struct ActivityTracker(Arc<StdMutex<Instant>>);

impl ActivityTracker {
    pub fn new() -> Self {
        Self(Arc::new(StdMutex::new(Instant::now())))
    }

    /// Record that a real write just happened.
    pub fn record(&self) {
        *self.0.lock().unwrap() = Instant::now();
    }

    fn elapsed(&self) -> Duration {
        self.0.lock().unwrap().elapsed()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running keepalive task; dropping it does not stop the task,
/// call [`KeepaliveHandle::stop`] explicitly.
pub struct KeepaliveHandle {
    notify: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl KeepaliveHandle {
    /// Signal the keepalive task to exit and wait for it to do so.
    pub async fn stop(mut self) {
        self.notify.notify_one();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Start the keepalive task. An `interval` of zero disables keepalives
/// entirely: the returned handle's task is a no-op that exits immediately
/// on `stop`. `activity` is checked on every tick; a tick that lands within
/// `interval` of the last recorded write is skipped rather than sending a
/// redundant filler byte.
pub fn spawn<W>(writer: Arc<Mutex<W>>, interval: Duration, activity: ActivityTracker) -> KeepaliveHandle
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let notify = Arc::new(Notify::new());
    if interval.is_zero() {
        return KeepaliveHandle { notify, task: None };
    }

    let task_notify = notify.clone();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = task_notify.notified() => {
                    debug!("keepalive task stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if activity.elapsed() < interval {
                        trace!("recent write observed, skipping keepalive byte");
                        continue;
                    }
                    let mut guard = writer.lock().await;
                    if let Err(e) = guard.write_all(b" ").await {
                        trace!("keepalive write failed, leaving reconnection to the caller: {}", e);
                        return;
                    }
                    if let Err(e) = guard.flush().await {
                        trace!("keepalive flush failed: {}", e);
                        return;
                    }
                    activity.record();
                }
            }
        }
    });

    KeepaliveHandle { notify, task: Some(task) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn zero_interval_disables_keepalive() {
        let buf = Arc::new(Mutex::new(Vec::<u8>::new()));
        let handle = spawn(buf.clone(), Duration::ZERO, ActivityTracker::new());
        handle.stop().await;
        assert!(buf.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn writes_a_single_space_byte_per_tick() {
        let buf = Arc::new(Mutex::new(Vec::<u8>::new()));
        let handle = spawn(buf.clone(), Duration::from_secs(10), ActivityTracker::new());
        tokio::time::advance(Duration::from_secs(25)).await;
        tokio::task::yield_now().await;
        handle.stop().await;
        let written = buf.lock().await;
        assert!(!written.is_empty());
        assert!(written.iter().all(|&b| b == b' '));
    }

    #[tokio::test(start_paused = true)]
    async fn recent_activity_suppresses_the_tick() {
        let buf = Arc::new(Mutex::new(Vec::<u8>::new()));
        let activity = ActivityTracker::new();
        let handle = spawn(buf.clone(), Duration::from_secs(10), activity.clone());
        tokio::time::advance(Duration::from_secs(9)).await;
        activity.record();
        tokio::time::advance(Duration::from_secs(2)).await; // tick at 10s, last write 1s ago
        tokio::task::yield_now().await;
        handle.stop().await;
        assert!(buf.lock().await.is_empty());
    }
}
