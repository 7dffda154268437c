use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::receiver::Receiver;
use super::sender::Sender;

/// Moves messages from a receiver into a sender until either side ends.
///
/// When the pump stops, for any reason, the sender is shut down.
pub struct MessagePump {
    handle: JoinHandle<()>,
    stop: CancellationToken,
}

impl MessagePump {
    pub fn spawn<R>(mut receiver: R, sender: Arc<dyn Sender>) -> Self
    where
        R: Receiver + 'static,
    {
        let stop = CancellationToken::new();
        let stop_signal = stop.clone();
        let handle = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    () = stop_signal.cancelled() => break,
                    received = receiver.receive() => received,
                };
                match received {
                    Ok(Some(message)) => {
                        if let Err(err) = sender.send(&message).await {
                            error!(
                                "Failed to handle {} message: {}",
                                message.kind().as_str(),
                                err
                            );
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("Message pump reached end of stream");
                        break;
                    }
                    Err(err) => {
                        error!("Message pump receive failed: {}", err);
                        break;
                    }
                }
            }
            receiver.shutdown();
            sender.shutdown().await;
        });
        Self { handle, stop }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the pump and waits for the sender to be shut down.
    pub async fn shutdown(self) {
        self.stop.cancel();
        if let Err(err) = self.handle.await {
            eprintln!("Message pump task failed: {}", err);
        }
    }

    /// Waits for the pump to stop on its own.
    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            eprintln!("Message pump task failed: {}", err);
        }
    }
}
