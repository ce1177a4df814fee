//! Async test helpers

use std::future::Future;
use tokio::time::{timeout, Duration, Instant};

/// Default timeout for convergence waits
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between condition checks
pub const POLL_STEP: Duration = Duration::from_millis(20);

/// Poll `condition` until it holds or `limit` elapses. Returns whether it held.
pub async fn wait_until<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + limit;

    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_STEP).await;
    }
}

/// Assert a future completes within `limit`
pub async fn assert_completes_within<F, T>(limit: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    match timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => panic!("Future did not complete within {:?}", limit),
    }
}
