//! Background maintenance loop.
//!
//! One long-running task serving three signals: the periodic expiry sweep,
//! on-demand database resets requested by the corruption funnel, and
//! shutdown. Shutdown is acknowledged on a dedicated channel only after the
//! in-flight action finished, so the store is never closed mid-write.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::errors::{DaemonError, Result};
use crate::users::UserManager;

/// Cadence of the expiry sweep.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct CleanupOptions {
    pub interval: Duration,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

pub struct CleanupHandle {
    shutdown_tx: mpsc::Sender<()>,
    stopped_rx: oneshot::Receiver<()>,
}

impl CleanupHandle {
    /// Stop the loop and wait for its acknowledgement.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.stopped_rx.await;
    }
}

/// Start the cleanup task. Fails if the manager's clear channel was already
/// taken: there is exactly one loop per manager.
pub fn spawn(manager: Arc<UserManager>, options: CleanupOptions) -> Result<CleanupHandle> {
    let mut clear_rx = manager
        .take_clear_rx()
        .ok_or_else(|| DaemonError::Internal("cleanup loop already running".into()))?;

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let (stopped_tx, stopped_rx) = oneshot::channel();

    tokio::spawn(async move {
        // The startup sweep already ran; first tick fires one interval in.
        let start = tokio::time::Instant::now() + options.interval;
        let mut ticker = tokio::time::interval_at(start, options.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Running periodic expiry sweep");
                    if let Err(e) = manager.clean_expired_user_data() {
                        warn!("Could not clean expired user data: {e}");
                    }
                }
                Some(()) = clear_rx.recv() => {
                    info!("Clearing the database on request");
                    if let Err(e) = manager.clear_database() {
                        warn!("Could not clear corrupted data: {e}");
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        let _ = stopped_tx.send(());
    });

    Ok(CleanupHandle {
        shutdown_tx,
        stopped_rx,
    })
}
