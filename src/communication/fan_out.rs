use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::CommunicationError;

use super::message::Message;
use super::sender::Sender;

struct FanOutEntry {
    key: u64,
    sender: Arc<dyn Sender>,
}

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Broadcasts each message to every live stream. A stream whose send fails
/// or takes longer than the send timeout is shut down and removed; the
/// failure never reaches the caller.
pub struct FanOutSender {
    streams: Mutex<Vec<FanOutEntry>>,
    send_timeout: Duration,
}

impl Default for FanOutSender {
    fn default() -> Self {
        Self::with_send_timeout(DEFAULT_SEND_TIMEOUT)
    }
}

impl FanOutSender {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_send_timeout(send_timeout: Duration) -> Self {
        Self {
            streams: Mutex::new(Vec::new()),
            send_timeout,
        }
    }

    /// Registers a stream under `key`, replacing any stream already there.
    pub async fn add(&self, key: u64, sender: Arc<dyn Sender>) {
        let replaced = {
            let mut streams = self.streams.lock().await;
            let replaced = streams
                .iter()
                .position(|entry| entry.key == key)
                .map(|index| streams.swap_remove(index));
            streams.push(FanOutEntry { key, sender });
            replaced
        };
        if let Some(entry) = replaced {
            entry.sender.shutdown().await;
        }
    }

    /// Removes and shuts down the stream registered under `key`.
    pub async fn remove(&self, key: u64) -> bool {
        let removed = {
            let mut streams = self.streams.lock().await;
            streams
                .iter()
                .position(|entry| entry.key == key)
                .map(|index| streams.swap_remove(index))
        };
        match removed {
            Some(entry) => {
                entry.sender.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.streams.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.streams.lock().await.is_empty()
    }
}

#[async_trait]
impl Sender for FanOutSender {
    async fn send(&self, message: &Message) -> Result<(), CommunicationError> {
        let mut streams = self.streams.lock().await;
        let mut failed = Vec::new();
        for entry in streams.iter() {
            let sent = tokio::time::timeout(self.send_timeout, entry.sender.send(message))
                .await
                .unwrap_or_else(|_elapsed| {
                    Err(CommunicationError::SendTimeout {
                        timeout_ms: self.send_timeout.as_millis(),
                    })
                });
            if let Err(err) = sent {
                warn!(
                    "Dropping stream {} after failed {} send: {}",
                    entry.key,
                    message.kind().as_str(),
                    err
                );
                failed.push(entry.key);
            }
        }
        if failed.is_empty() {
            return Ok(());
        }
        let mut dead = Vec::with_capacity(failed.len());
        streams.retain(|entry| {
            if failed.contains(&entry.key) {
                dead.push(Arc::clone(&entry.sender));
                false
            } else {
                true
            }
        });
        drop(streams);
        for sender in dead {
            sender.shutdown().await;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let streams = std::mem::take(&mut *self.streams.lock().await);
        debug!("Shutting down {} fan-out streams", streams.len());
        for entry in streams {
            entry.sender.shutdown().await;
        }
    }
}
