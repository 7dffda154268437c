use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::communication::{FanOutSender, Message, Sender, StartMessage};
use crate::error::CommunicationError;

use super::process_status::{ProcessStatus, StatusUpdate};

/// Operator control over every connected agent.
#[derive(Clone)]
pub struct ProcessControl {
    agents: Arc<FanOutSender>,
    status: Arc<ProcessStatus>,
}

impl ProcessControl {
    #[must_use]
    pub const fn new(agents: Arc<FanOutSender>, status: Arc<ProcessStatus>) -> Self {
        Self { agents, status }
    }

    /// Tells the agents to start their workers. `script` is resolved inside
    /// each agent's file store; `None` runs the agents' own scripts.
    ///
    /// # Errors
    ///
    /// Returns an error when the broadcast fails.
    pub async fn start_worker_processes(
        &self,
        script: Option<PathBuf>,
    ) -> Result<(), CommunicationError> {
        info!(
            "Starting workers on {} agents",
            self.status.number_of_live_agents()
        );
        self.agents.send(&Message::Start(StartMessage { script })).await
    }

    /// # Errors
    ///
    /// Returns an error when the broadcast fails.
    pub async fn reset_worker_processes(&self) -> Result<(), CommunicationError> {
        info!("Resetting workers");
        self.agents.send(&Message::Reset).await
    }

    /// # Errors
    ///
    /// Returns an error when the broadcast fails.
    pub async fn stop_agent_and_worker_processes(&self) -> Result<(), CommunicationError> {
        info!("Stopping agents");
        self.agents.send(&Message::Stop).await
    }

    #[must_use]
    pub fn number_of_live_agents(&self) -> usize {
        self.status.number_of_live_agents()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<StatusUpdate> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn agents(&self) -> Arc<FanOutSender> {
        Arc::clone(&self.agents)
    }
}
