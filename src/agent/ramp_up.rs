use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::EngineError;

use super::launcher::WorkerLauncher;

/// Starts `increment` more workers every `interval` until the population is
/// exhausted or the ramp-up is cancelled.
pub struct RampUp {
    handle: JoinHandle<()>,
    stop: CancellationToken,
}

impl RampUp {
    #[must_use]
    pub fn spawn(launcher: Arc<WorkerLauncher>, increment: usize, interval: Duration) -> Self {
        let stop = CancellationToken::new();
        let stop_signal = stop.clone();
        let handle = tokio::spawn(async move {
            let first_tick = Instant::now()
                .checked_add(interval)
                .unwrap_or_else(Instant::now);
            let mut ticker = tokio::time::interval_at(first_tick, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = stop_signal.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match launcher.start_some_workers(increment).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("Ramp-up complete");
                        break;
                    }
                    Err(err) => {
                        error!("Ramp-up failed to start a worker: {}", err);
                        launcher.dont_start_any_more();
                        break;
                    }
                }
            }
        });
        Self { handle, stop }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn cancel(self) {
        self.stop.cancel();
        if let Err(err) = self.handle.await {
            eprintln!("Ramp-up task failed: {}", err);
        }
    }
}

/// Starts the first batch of workers: everything at once without ramp-up,
/// otherwise `initial` workers followed by a [`RampUp`] for the rest.
///
/// # Errors
///
/// Returns the launcher's error when a worker of the first batch cannot be
/// started.
pub async fn start_workers(
    launcher: &Arc<WorkerLauncher>,
    initial: usize,
    increment: usize,
    interval: Duration,
) -> Result<Option<RampUp>, EngineError> {
    if increment == 0 {
        launcher.start_all_workers().await?;
        return Ok(None);
    }
    if launcher.start_some_workers(initial).await? {
        return Ok(Some(RampUp::spawn(Arc::clone(launcher), increment, interval)));
    }
    Ok(None)
}
