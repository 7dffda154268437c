//! Worker runtime: receives its setup from the agent, runs one script, and
//! reports its lifecycle to the console.
mod script_runner;

#[cfg(test)]
mod tests;

use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::communication::{
    ConnectionType, Connector, InitialiseWorker, Message, ProcessState, Receiver, Sender,
    StreamReceiver, StreamSender, WorkerProcessReport,
};
use crate::error::{AppError, AppResult, CommunicationError, EngineError};
use crate::identity::WorkerIdentity;

pub use script_runner::{CommandScriptRunner, ScriptRunner};

/// Exit code reported when the script was killed rather than exiting.
pub const KILLED_EXIT_CODE: i32 = -1;

/// Runs a worker whose communication stream is `stream`.
///
/// The first message must be [`Message::InitialiseWorker`]. The worker runs
/// its script until the script exits, a stop or reset arrives, the stream
/// closes, or `token` is cancelled, and returns the script's exit code.
///
/// # Errors
///
/// Returns an error when initialisation fails or the script cannot start.
pub async fn run_worker<R>(stream: R, token: CancellationToken) -> AppResult<i32>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut receiver = StreamReceiver::new(stream);
    let init = receive_initialisation(&mut receiver).await?;
    let runner = CommandScriptRunner::new(init.interpreter.clone());
    run_initialised_worker(init, receiver, &runner, token).await
}

async fn receive_initialisation<R>(receiver: &mut R) -> AppResult<InitialiseWorker>
where
    R: Receiver,
{
    match receiver.receive().await? {
        Some(Message::InitialiseWorker(init)) => Ok(init),
        Some(other) => Err(AppError::engine(EngineError::UnexpectedInitialisation {
            kind: other.kind().as_str(),
        })),
        None => Err(AppError::engine(EngineError::MissingInitialisation)),
    }
}

pub(crate) async fn run_initialised_worker<R, S>(
    init: InitialiseWorker,
    receiver: R,
    runner: &S,
    token: CancellationToken,
) -> AppResult<i32>
where
    R: Receiver + 'static,
    S: ScriptRunner + ?Sized,
{
    let mut reporter = ConsoleReporter::connect(&init).await;
    reporter.report(ProcessState::Started, None).await;

    let mut child = match runner.spawn(&init.script, &init.working_directory) {
        Ok(child) => child,
        Err(err) => {
            reporter
                .report(ProcessState::Finished, Some(KILLED_EXIT_CODE))
                .await;
            reporter.shutdown().await;
            return Err(AppError::engine(err));
        }
    };
    info!(
        "Worker {} running {}",
        init.identity,
        init.script.display()
    );

    let (mut inbound, forwarder) = forward_messages(receiver);
    let report_interval = Duration::from_millis(init.report_interval_ms.max(1));
    let first_tick = Instant::now()
        .checked_add(report_interval)
        .unwrap_or_else(Instant::now);
    let mut ticker = tokio::time::interval_at(first_tick, report_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let exit_code = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => exit_code(status),
                    Err(err) => {
                        warn!("Failed to wait for script of {}: {}", init.identity, err);
                        KILLED_EXIT_CODE
                    }
                };
            }
            received = inbound.recv() => match received {
                Some(Ok(Some(Message::Stop | Message::Reset))) => {
                    info!("Worker {} told to stop", init.identity);
                    break kill(&mut child).await;
                }
                Some(Ok(Some(message))) => {
                    debug!("Worker {} ignoring {} message", init.identity, message.kind().as_str());
                }
                None | Some(Ok(None)) => {
                    info!("Agent closed the stream of worker {}", init.identity);
                    break kill(&mut child).await;
                }
                Some(Err(err)) => {
                    warn!("Worker {} stream failed: {}", init.identity, err);
                    break kill(&mut child).await;
                }
            },
            _ = ticker.tick() => reporter.report(ProcessState::Running, None).await,
            () = token.cancelled() => break kill(&mut child).await,
        }
    };

    info!("Worker {} finished with exit code {}", init.identity, exit_code);
    reporter
        .report(ProcessState::Finished, Some(exit_code))
        .await;
    reporter.shutdown().await;
    forwarder.abort();
    Ok(exit_code)
}

type Received = Result<Option<Message>, CommunicationError>;

/// Reads on a separate task so that a partially read frame is never dropped
/// by the worker's select loop.
fn forward_messages<R>(mut receiver: R) -> (mpsc::UnboundedReceiver<Received>, JoinHandle<()>)
where
    R: Receiver + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        loop {
            let received = receiver.receive().await;
            let finished = !matches!(received, Ok(Some(_)));
            if tx.send(received).is_err() || finished {
                break;
            }
        }
        receiver.shutdown();
    });
    (rx, handle)
}

async fn kill(child: &mut Child) -> i32 {
    if let Err(err) = child.kill().await {
        warn!("Failed to kill script process: {}", err);
    }
    KILLED_EXIT_CODE
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(KILLED_EXIT_CODE)
}

struct ConsoleReporter {
    identity: WorkerIdentity,
    sender: Option<StreamSender<TcpStream>>,
}

impl ConsoleReporter {
    async fn connect(init: &InitialiseWorker) -> Self {
        let mut reporter = Self {
            identity: init.identity.clone(),
            sender: None,
        };
        if !init.report_to_console {
            return reporter;
        }
        let Some(address) = init.console_address.as_deref() else {
            return reporter;
        };
        let Some(connector) = Connector::from_address(address, ConnectionType::Worker) else {
            warn!("Invalid console address '{}'", address);
            return reporter;
        };
        match connector.connect().await {
            Ok((stream, _details)) => reporter.sender = Some(StreamSender::new(stream)),
            Err(err) => warn!(
                "Worker {} cannot report to the console: {}",
                init.identity, err
            ),
        }
        reporter
    }

    async fn report(&mut self, state: ProcessState, exit_code: Option<i32>) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        let message = Message::WorkerProcessReport(WorkerProcessReport {
            identity: self.identity.clone(),
            state,
            exit_code,
        });
        if let Err(err) = sender.send(&message).await {
            warn!("Worker {} lost the console: {}", self.identity, err);
            self.sender = None;
        }
    }

    async fn shutdown(self) {
        if let Some(sender) = self.sender {
            sender.shutdown().await;
        }
    }
}
