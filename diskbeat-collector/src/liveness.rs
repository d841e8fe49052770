//! Idle shutdown
//!
//! The collector stays up while at least one probe is active. Once none is,
//! a countdown of `grace` starts; any probe becoming active cancels it, and
//! the next idle period starts a fresh countdown.

use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Resolves once the active count stayed at zero for `grace`, or the
/// aggregator that publishes the count is gone
pub async fn wait_for_idle(mut active: watch::Receiver<usize>, grace: Duration) {
    loop {
        let count = *active.borrow_and_update();
        if count == 0 {
            debug!("no active probes, shutting down in {:?} unless one arrives", grace);
            tokio::select! {
                _ = tokio::time::sleep(grace) => {
                    info!("no active probes for {:?}", grace);
                    return;
                }
                changed = active.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        } else if active.changed().await.is_err() {
            return;
        }
    }
}
