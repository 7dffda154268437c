use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::CommunicationError;

use super::codec::write_message;
use super::message::Message;

/// Something that accepts messages.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Delivers one message.
    ///
    /// # Errors
    ///
    /// Returns an error when the message cannot be delivered.
    async fn send(&self, message: &Message) -> Result<(), CommunicationError>;

    /// Releases the underlying resources. Calling it more than once is a
    /// no-op.
    async fn shutdown(&self);
}

#[async_trait]
impl<T> Sender for Arc<T>
where
    T: Sender + ?Sized,
{
    async fn send(&self, message: &Message) -> Result<(), CommunicationError> {
        (**self).send(message).await
    }

    async fn shutdown(&self) {
        (**self).shutdown().await;
    }
}

/// Writes framed messages to one output stream. A failed write tears the
/// stream down; later sends fail with [`CommunicationError::Shutdown`].
pub struct StreamSender<W> {
    writer: Mutex<Option<W>>,
}

impl<W> StreamSender<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
        }
    }

    pub async fn is_shut_down(&self) -> bool {
        self.writer.lock().await.is_none()
    }
}

#[async_trait]
impl<W> Sender for StreamSender<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, message: &Message) -> Result<(), CommunicationError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(CommunicationError::Shutdown)?;
        let result = write_message(writer, message).await;
        if result.is_err() {
            guard.take();
        }
        result
    }

    async fn shutdown(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer
            && let Err(err) = writer.shutdown().await
        {
            tracing::debug!("Stream shutdown failed: {}", err);
        }
    }
}

/// Forwards every message to two senders in turn.
pub struct TeeSender {
    first: Arc<dyn Sender>,
    second: Arc<dyn Sender>,
}

impl TeeSender {
    pub fn new(first: Arc<dyn Sender>, second: Arc<dyn Sender>) -> Self {
        Self { first, second }
    }
}

#[async_trait]
impl Sender for TeeSender {
    async fn send(&self, message: &Message) -> Result<(), CommunicationError> {
        self.first.send(message).await?;
        self.second.send(message).await
    }

    async fn shutdown(&self) {
        self.first.shutdown().await;
        self.second.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::codec::read_message;
    use crate::error::{AppError, AppResult};
    use crate::test_support::run_async_test;

    #[test]
    fn shutdown_is_idempotent_and_rejects_sends() -> AppResult<()> {
        run_async_test(async {
            let (client, mut server) = tokio::io::duplex(1024);
            let sender = StreamSender::new(client);
            sender.send(&Message::Stop).await?;
            sender.shutdown().await;
            sender.shutdown().await;

            if !matches!(
                sender.send(&Message::Stop).await,
                Err(CommunicationError::Shutdown)
            ) {
                return Err(AppError::validation("Expected send after shutdown to fail"));
            }
            if read_message(&mut server).await? != Some(Message::Stop) {
                return Err(AppError::validation("Expected message written before shutdown"));
            }
            if read_message(&mut server).await?.is_some() {
                return Err(AppError::validation("Expected stream closed after shutdown"));
            }
            Ok(())
        })
    }

    #[test]
    fn broken_stream_is_torn_down() -> AppResult<()> {
        run_async_test(async {
            let (client, server) = tokio::io::duplex(64);
            drop(server);
            let sender = StreamSender::new(client);
            if sender.send(&Message::Reset).await.is_ok() {
                return Err(AppError::validation("Expected send to a closed pipe to fail"));
            }
            if !sender.is_shut_down().await {
                return Err(AppError::validation("Expected sender torn down"));
            }
            Ok(())
        })
    }
}
