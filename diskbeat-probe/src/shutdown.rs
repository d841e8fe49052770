//! Probe-wide stop latch
//!
//! Set once by the run deadline, an operator interrupt or a fatal runtime
//! condition; observed by every worker. It never resets.

use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the latch. Calling it again is a no-op.
    pub fn signal(&self) {
        if !self.token.is_cancelled() {
            debug!("shutdown signalled");
        }
        self.token.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves as soon as the latch is set (immediately if it already is)
    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}
