//! The console: accepts agent and worker connections, aggregates their
//! reports, and drives agents and file distribution on operator command.
mod commands;
pub mod distribution;
mod process_control;
mod process_status;


use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::communication::{
    Acceptor, AddressedMessage, MessageDispatch, MessageHandler, MessageKind, Sender,
};
use crate::config::ConsoleSettings;
use crate::error::{AppResult, CommunicationError};

use distribution::{DistributionFilter, FileDistribution, FileDistributionHandler};

pub use commands::{ConsoleCommand, run_commands, spawn_status_logger};
pub use process_control::ProcessControl;
pub use process_status::{ProcessReports, ProcessStatus, StatusUpdate};

/// A running console.
pub struct Console {
    acceptor: Acceptor,
    status: Arc<ProcessStatus>,
    control: ProcessControl,
    distribution: FileDistribution,
    dispatch_task: JoinHandle<()>,
    sweeps: JoinHandle<()>,
    stop: CancellationToken,
}

impl Console {
    /// Binds the listen address and starts routing reports.
    ///
    /// # Errors
    ///
    /// Returns an error when the distribution settings are invalid or the
    /// address cannot be bound.
    pub async fn start(settings: &ConsoleSettings) -> AppResult<Self> {
        let filter = DistributionFilter::new(&settings.distribution_filter)?;
        let distribution = FileDistribution::new(&settings.distribution_directory, filter)?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let acceptor = Acceptor::bind(&settings.listen_address(), inbound_tx).await?;

        let status = Arc::new(ProcessStatus::new());
        let mut dispatch = MessageDispatch::new();
        for kind in [MessageKind::AgentProcessReport, MessageKind::WorkerProcessReport] {
            dispatch.register(kind, Arc::clone(&status) as Arc<dyn MessageHandler>);
        }

        let stop = CancellationToken::new();
        let dispatch_task = tokio::spawn(dispatch_loop(inbound_rx, dispatch, stop.clone()));
        let sweeps = status.spawn_sweeps(
            settings.update_interval,
            settings.flush_interval,
            stop.clone(),
        );
        let control = ProcessControl::new(acceptor.agent_sender(), Arc::clone(&status));
        info!(
            "Console listening on {}, distributing {}",
            acceptor.local_addr(),
            distribution.directory().display()
        );
        Ok(Self {
            acceptor,
            status,
            control,
            distribution,
            dispatch_task,
            sweeps,
            stop,
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    #[must_use]
    pub const fn process_control(&self) -> &ProcessControl {
        &self.control
    }

    #[must_use]
    pub const fn process_status(&self) -> &Arc<ProcessStatus> {
        &self.status
    }

    #[must_use]
    pub const fn file_distribution(&self) -> &FileDistribution {
        &self.distribution
    }

    /// A distribution to every connected agent, starting from the oldest
    /// cache any of them reports.
    #[must_use]
    pub fn distribution_handler(&self) -> FileDistributionHandler {
        self.distribution.handler(
            &self.status.agent_cache_marks(),
            self.control.agents() as Arc<dyn Sender>,
        )
    }

    /// Sends every out of date file, returning how many were sent.
    ///
    /// # Errors
    ///
    /// Returns the first file or broadcast failure.
    pub async fn distribute_files(&self) -> Result<usize, CommunicationError> {
        let mut handler = self.distribution_handler();
        let mut sent = 0usize;
        while let Some(progress) = handler.send_next_file().await? {
            sent = sent.saturating_add(1);
            info!(
                "Distributed {} ({}%)",
                progress.file_name.display(),
                progress.percent
            );
        }
        Ok(sent)
    }

    /// Stops the sweeps and closes every connection.
    pub async fn shutdown(self) {
        self.stop.cancel();
        for (name, task) in [("dispatch", self.dispatch_task), ("sweep", self.sweeps)] {
            if let Err(err) = task.await {
                eprintln!("Console {} task failed: {}", name, err);
            }
        }
        self.acceptor.shutdown().await;
        info!("Console stopped");
    }
}

async fn dispatch_loop(
    mut inbound: mpsc::UnboundedReceiver<AddressedMessage>,
    dispatch: MessageDispatch,
    stop: CancellationToken,
) {
    loop {
        let addressed = tokio::select! {
            () = stop.cancelled() => break,
            addressed = inbound.recv() => addressed,
        };
        let Some(addressed) = addressed else {
            break;
        };
        if let Err(err) = dispatch.send(&addressed.message).await {
            warn!(
                "Failed to handle {} from {}: {}",
                addressed.message.kind().as_str(),
                addressed.connection,
                err
            );
        }
    }
    debug!("Console dispatch stopped");
}

/// Runs a console until the operator quits or `token` is cancelled.
///
/// Operator commands are read from stdin.
///
/// # Errors
///
/// Returns an error when the console cannot start or stdin fails.
pub async fn run_console(settings: &ConsoleSettings, token: CancellationToken) -> AppResult<()> {
    let console = Console::start(settings).await?;
    let logger = spawn_status_logger(console.process_control().subscribe(), token.clone());
    info!("Commands: start [script], stop, reset, distribute, status, quit");

    let result = run_commands(&console, BufReader::new(tokio::io::stdin()), &token).await;
    token.cancel();
    if let Err(err) = logger.await {
        eprintln!("Status logger failed: {}", err);
    }
    console.shutdown().await;
    result
}
