use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CommunicationError;

use super::message::{Message, MessageKind};
use super::sender::Sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Handled,
    NotHandled,
}

/// One link of a handler chain.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Offers a message to the handler.
    ///
    /// # Errors
    ///
    /// Returns an error when the handler claimed the message but failed to
    /// process it.
    async fn handle(&self, message: &Message) -> Result<HandlerOutcome, CommunicationError>;

    async fn shutdown(&self) {}
}

/// Lets a [`Sender`] observe messages in a chain without consuming them.
pub struct SenderHandler {
    sender: Arc<dyn Sender>,
}

impl SenderHandler {
    pub fn new(sender: Arc<dyn Sender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl MessageHandler for SenderHandler {
    async fn handle(&self, message: &Message) -> Result<HandlerOutcome, CommunicationError> {
        self.sender.send(message).await?;
        Ok(HandlerOutcome::NotHandled)
    }

    async fn shutdown(&self) {
        self.sender.shutdown().await;
    }
}

/// Ordered handlers; the first to report [`HandlerOutcome::Handled`] consumes
/// the message and anything unclaimed goes to the fallback.
#[derive(Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn MessageHandler>>,
    fallback: Option<Arc<dyn Sender>>,
}

impl HandlerChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    #[must_use]
    pub fn with_sender(self, sender: Arc<dyn Sender>) -> Self {
        self.with_handler(Arc::new(SenderHandler::new(sender)))
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn Sender>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

#[async_trait]
impl Sender for HandlerChain {
    async fn send(&self, message: &Message) -> Result<(), CommunicationError> {
        for handler in &self.handlers {
            if handler.handle(message).await? == HandlerOutcome::Handled {
                return Ok(());
            }
        }
        match &self.fallback {
            Some(fallback) => fallback.send(message).await,
            None => Ok(()),
        }
    }

    async fn shutdown(&self) {
        for handler in &self.handlers {
            handler.shutdown().await;
        }
        if let Some(fallback) = &self.fallback {
            fallback.shutdown().await;
        }
    }
}

/// Routes messages to handlers registered by [`MessageKind`].
#[derive(Default)]
pub struct MessageDispatch {
    handlers: HashMap<MessageKind, Arc<dyn MessageHandler>>,
    fallback: Option<Arc<dyn Sender>>,
}

impl MessageDispatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `kind`, returning any handler it replaces.
    pub fn register(
        &mut self,
        kind: MessageKind,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.insert(kind, handler)
    }

    pub fn set_fallback(&mut self, fallback: Arc<dyn Sender>) {
        self.fallback = Some(fallback);
    }
}

#[async_trait]
impl Sender for MessageDispatch {
    async fn send(&self, message: &Message) -> Result<(), CommunicationError> {
        if let Some(handler) = self.handlers.get(&message.kind())
            && handler.handle(message).await? == HandlerOutcome::Handled
        {
            return Ok(());
        }
        match &self.fallback {
            Some(fallback) => fallback.send(message).await,
            None => {
                tracing::debug!("No handler for {} message", message.kind().as_str());
                Ok(())
            }
        }
    }

    async fn shutdown(&self) {
        for handler in self.handlers.values() {
            handler.shutdown().await;
        }
        if let Some(fallback) = &self.fallback {
            fallback.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::error::{AppError, AppResult};
    use crate::test_support::run_async_test;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<MessageKind>>,
        shut_down: AtomicBool,
    }

    impl Recorder {
        fn seen(&self) -> Vec<MessageKind> {
            self.seen
                .lock()
                .map(|seen| seen.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl Sender for Recorder {
        async fn send(&self, message: &Message) -> Result<(), CommunicationError> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(message.kind());
            }
            Ok(())
        }

        async fn shutdown(&self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    struct Claims(MessageKind);

    #[async_trait]
    impl MessageHandler for Claims {
        async fn handle(&self, message: &Message) -> Result<HandlerOutcome, CommunicationError> {
            if message.kind() == self.0 {
                Ok(HandlerOutcome::Handled)
            } else {
                Ok(HandlerOutcome::NotHandled)
            }
        }
    }

    struct Fails;

    #[async_trait]
    impl MessageHandler for Fails {
        async fn handle(&self, _message: &Message) -> Result<HandlerOutcome, CommunicationError> {
            Err(CommunicationError::ConnectionClosed)
        }
    }

    #[test]
    fn first_claiming_handler_wins_and_rest_fall_back() -> AppResult<()> {
        run_async_test(async {
            let observer = Arc::new(Recorder::default());
            let fallback = Arc::new(Recorder::default());
            let chain = HandlerChain::new()
                .with_sender(Arc::clone(&observer) as Arc<dyn Sender>)
                .with_handler(Arc::new(Claims(MessageKind::ClearCache)))
                .with_fallback(Arc::clone(&fallback) as Arc<dyn Sender>);

            chain.send(&Message::ClearCache).await?;
            chain.send(&Message::Stop).await?;
            chain.shutdown().await;

            if observer.seen() != vec![MessageKind::ClearCache, MessageKind::Stop] {
                return Err(AppError::validation("Observer should see every message"));
            }
            if fallback.seen() != vec![MessageKind::Stop] {
                return Err(AppError::validation("Fallback should see only unclaimed messages"));
            }
            if !observer.shut_down.load(Ordering::SeqCst) || !fallback.shut_down.load(Ordering::SeqCst)
            {
                return Err(AppError::validation("Shutdown should reach every link"));
            }
            Ok(())
        })
    }

    #[test]
    fn handler_error_stops_the_chain() -> AppResult<()> {
        run_async_test(async {
            let fallback = Arc::new(Recorder::default());
            let chain = HandlerChain::new()
                .with_handler(Arc::new(Fails))
                .with_fallback(Arc::clone(&fallback) as Arc<dyn Sender>);
            if chain.send(&Message::Reset).await.is_ok() {
                return Err(AppError::validation("Expected handler error"));
            }
            if !fallback.seen().is_empty() {
                return Err(AppError::validation("Fallback should not run after an error"));
            }
            Ok(())
        })
    }

    #[test]
    fn dispatch_routes_by_kind() -> AppResult<()> {
        run_async_test(async {
            let fallback = Arc::new(Recorder::default());
            let mut dispatch = MessageDispatch::new();
            dispatch.register(MessageKind::Stop, Arc::new(Claims(MessageKind::Stop)));
            dispatch.set_fallback(Arc::clone(&fallback) as Arc<dyn Sender>);

            dispatch.send(&Message::Stop).await?;
            dispatch.send(&Message::Reset).await?;
            if fallback.seen() != vec![MessageKind::Reset] {
                return Err(AppError::validation(format!(
                    "Unexpected fallback messages {:?}",
                    fallback.seen()
                )));
            }
            Ok(())
        })
    }
}
