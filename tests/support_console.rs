use std::future::Future;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs `future` on a fresh multi-threaded runtime.
///
/// # Errors
///
/// Returns an error when the runtime cannot be built or the future fails.
pub fn run_async<F>(future: F) -> Result<(), String>
where
    F: Future<Output = Result<(), String>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .map_err(|err| format!("build runtime failed: {}", err))?;
    let result = runtime.block_on(future);
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

/// Polls `condition` until it holds or `timeout` passes.
///
/// # Errors
///
/// Returns an error naming `what` on timeout.
pub async fn wait_until<F>(what: &str, timeout: Duration, mut condition: F) -> Result<(), String>
where
    F: FnMut() -> bool,
{
    let started = Instant::now();
    while !condition() {
        if started.elapsed() > timeout {
            return Err(format!("Timed out waiting for {}", what));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Ok(())
}
