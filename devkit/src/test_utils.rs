/*!
Test helpers shared by probe and collector tests
*/

use std::time::Duration;
use tracing_subscriber::filter::LevelFilter;

/// Routes `tracing` and `log` output through the test harness capture.
/// Safe to call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Polls `condition` every 20ms until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    loop {
        if condition() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_wait_until_polls_until_true() {
        init_test_logging();
        let calls = AtomicUsize::new(0);
        let reached = wait_until(Duration::from_secs(1), || calls.fetch_add(1, Ordering::SeqCst) >= 3).await;
        assert!(reached);
        assert!(!wait_until(Duration::from_millis(50), || false).await);
    }
}
