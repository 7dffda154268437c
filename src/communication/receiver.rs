use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::error::CommunicationError;

use super::codec::read_message;
use super::message::Message;

/// Source of messages.
#[async_trait]
pub trait Receiver: Send {
    /// Waits for the next message. `Ok(None)` means orderly shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or malformed framing.
    async fn receive(&mut self) -> Result<Option<Message>, CommunicationError>;

    /// Wakes any pending [`Receiver::receive`] with `Ok(None)`.
    fn shutdown(&self);
}

/// Reads framed messages from one input stream.
pub struct StreamReceiver<R> {
    reader: Option<R>,
    shutdown: CancellationToken,
}

impl<R> StreamReceiver<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that shuts this receiver down when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[async_trait]
impl<R> Receiver for StreamReceiver<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn receive(&mut self) -> Result<Option<Message>, CommunicationError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let result = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Ok(None),
            result = read_message(reader) => result,
        };
        if !matches!(result, Ok(Some(_))) {
            self.reader = None;
        }
        result
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
