//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use std::future::Future;
use std::time::Duration;

/// Upper bound for any single connect or disconnect in tests
pub fn test_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Route library logs to the test harness, once per process
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("target_link=debug")
        .with_test_writer()
        .try_init();
}

/// Await `future`, failing the test if it hangs
pub async fn within_timeout<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(test_timeout(), future)
        .await
        .expect("operation did not finish in time")
}
