//! Polling configuration watcher.
//!
//! The configuration lives in an external properties file that operators
//! edit in place. A background task re-reads the file on a fixed interval
//! and emits a [`ConfigurationSnapshot`] through a bounded channel whenever
//! the parsed content differs from the last emitted snapshot, so a burst of
//! writes that lands on the same content produces no event at all.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::snapshot::ConfigurationSnapshot;

/// Default interval between file polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Capacity of the snapshot channel. Reconciliation consumes snapshots far
/// faster than a human edits a file; a small buffer is plenty.
const CHANNEL_CAPACITY: usize = 8;

/// Watches a configuration file and emits snapshots on change.
pub struct ConfigWatcher {
    path: PathBuf,
    poll_interval: Duration,
}

/// Handle for stopping a running watcher task.
pub struct ConfigWatcherHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ConfigWatcherHandle {
    /// Signals the watcher task to stop and waits for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

impl ConfigWatcher {
    /// Creates a watcher for `path` with the default poll interval.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self::with_poll_interval(path, DEFAULT_POLL_INTERVAL)
    }

    /// Creates a watcher with an explicit poll interval.
    #[must_use]
    pub fn with_poll_interval(path: PathBuf, poll_interval: Duration) -> Self {
        Self {
            path,
            poll_interval,
        }
    }

    /// Spawns the polling task.
    ///
    /// Returns the receiving end of the snapshot channel and a handle to
    /// stop the task. The first successful read always emits; afterwards a
    /// snapshot is emitted only when the parsed content changed. Read
    /// failures keep the previous state and are logged once per transition
    /// so a temporarily missing file does not flood the log.
    #[must_use]
    pub fn spawn(self) -> (mpsc::Receiver<ConfigurationSnapshot>, ConfigWatcherHandle) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            info!(path = %self.path.display(), "configuration watcher started");
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let mut last_emitted: Option<ConfigurationSnapshot> = None;
            let mut read_failed = false;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                match ConfigurationSnapshot::load(&self.path) {
                    Ok(snapshot) => {
                        read_failed = false;
                        if last_emitted.as_ref() == Some(&snapshot) {
                            continue;
                        }
                        debug!(
                            entries = snapshot.len(),
                            "configuration change detected"
                        );
                        if tx.send(snapshot.clone()).await.is_err() {
                            break;
                        }
                        last_emitted = Some(snapshot);
                    }
                    Err(e) => {
                        if !read_failed {
                            warn!(error = %e, "configuration read failed, keeping previous state");
                            read_failed = true;
                        }
                    }
                }
            }
            info!("configuration watcher stopped");
        });

        (
            rx,
            ConfigWatcherHandle {
                shutdown: shutdown_tx,
                join,
            },
        )
    }
}
