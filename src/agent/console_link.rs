use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::communication::{
    AgentProcessReport, Connector, FanOutSender, HandlerChain, Message, MessagePump,
    ProcessState, Sender, StreamReceiver, StreamSender, TeeSender,
};
use crate::error::CommunicationError;
use crate::identity::AgentIdentity;

use super::console_listener::ConsoleListener;
use super::file_store::FileStore;

/// An agent's live connection to the console.
///
/// Inbound messages pass through the file store, then reach both the console
/// listener and every worker. While the link is up the agent reports itself
/// running at a fixed interval.
pub struct ConsoleLink {
    connector: Connector,
    agent_name: String,
    sender: Arc<StreamSender<OwnedWriteHalf>>,
    reporter: RunningReporter,
    pump: MessagePump,
}

/// Everything a link needs besides the socket.
pub struct LinkContext {
    pub identity: AgentIdentity,
    pub file_store: Arc<FileStore>,
    pub listener: Arc<ConsoleListener>,
    pub workers: Arc<FanOutSender>,
    pub report_interval: Duration,
}

impl ConsoleLink {
    /// Announces the agent and starts pumping console messages.
    pub async fn start(connector: Connector, stream: TcpStream, context: LinkContext) -> Self {
        let (read_half, write_half) = stream.into_split();
        let sender = Arc::new(StreamSender::new(write_half));
        let reporter = Reporter {
            identity: context.identity.clone(),
            file_store: Arc::clone(&context.file_store),
            sender: Arc::clone(&sender),
        };
        reporter.report(ProcessState::Started).await;

        let fallback = TeeSender::new(
            context.listener,
            Arc::new(WorkerBroadcast(context.workers)),
        );
        let chain = HandlerChain::new()
            .with_handler(context.file_store)
            .with_fallback(Arc::new(fallback));
        let pump = MessagePump::spawn(StreamReceiver::new(read_half), Arc::new(chain));
        info!("Connected to console at {}", connector.address());

        Self {
            connector,
            agent_name: context.identity.name().to_owned(),
            sender,
            reporter: reporter.spawn(context.report_interval),
            pump,
        }
    }

    #[must_use]
    pub const fn connector(&self) -> &Connector {
        &self.connector
    }

    #[must_use]
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Reports the agent finished, then closes the connection.
    pub async fn shutdown(self) {
        let reporter = self.reporter.stop().await;
        if let Some(reporter) = reporter {
            reporter.report(ProcessState::Finished).await;
        }
        self.sender.shutdown().await;
        self.pump.shutdown().await;
        debug!("Console link to {} closed", self.connector.address());
    }
}

struct Reporter {
    identity: AgentIdentity,
    file_store: Arc<FileStore>,
    sender: Arc<StreamSender<OwnedWriteHalf>>,
}

impl Reporter {
    async fn report(&self, state: ProcessState) -> bool {
        let message = Message::AgentProcessReport(AgentProcessReport {
            identity: self.identity.clone(),
            state,
            cache_high_water_mark: self.file_store.cache_high_water_mark(),
        });
        match self.sender.send(&message).await {
            Ok(()) => true,
            Err(err) => {
                warn!("Failed to report {} to the console: {}", state, err);
                false
            }
        }
    }

    fn spawn(self, interval: Duration) -> RunningReporter {
        let stop = CancellationToken::new();
        let stop_signal = stop.clone();
        let handle = tokio::spawn(async move {
            let first_tick = Instant::now()
                .checked_add(interval)
                .unwrap_or_else(Instant::now);
            let mut ticker = tokio::time::interval_at(first_tick, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = stop_signal.cancelled() => return Some(self),
                    _ = ticker.tick() => {
                        if !self.report(ProcessState::Running).await {
                            return None;
                        }
                    }
                }
            }
        });
        RunningReporter { handle, stop }
    }
}

struct RunningReporter {
    handle: JoinHandle<Option<Reporter>>,
    stop: CancellationToken,
}

impl RunningReporter {
    async fn stop(self) -> Option<Reporter> {
        self.stop.cancel();
        match self.handle.await {
            Ok(reporter) => reporter,
            Err(err) => {
                eprintln!("Console report task failed: {}", err);
                None
            }
        }
    }
}

/// Forwards console messages to workers. Shutdown leaves the worker streams
/// open; they belong to the launcher's workers, not to the link.
struct WorkerBroadcast(Arc<FanOutSender>);

#[async_trait]
impl Sender for WorkerBroadcast {
    async fn send(&self, message: &Message) -> Result<(), CommunicationError> {
        self.0.send(message).await
    }

    async fn shutdown(&self) {}
}
