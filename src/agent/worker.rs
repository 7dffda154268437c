use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::process::{Child, ChildStdin};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::communication::{FanOutSender, InitialiseWorker, Message, Sender, StreamSender};
use crate::error::{AppResult, EngineError};
use crate::identity::{AgentIdentity, WorkerIdentity, WorkerIdentitySequence};
use crate::worker::{KILLED_EXIT_CODE, run_worker};

use super::command_line::WorkerCommandLine;

const DEBUG_PIPE_CAPACITY: usize = 64 * 1024;

/// Handle that forcibly ends a worker. Destroying twice is harmless.
#[derive(Debug, Clone, Default)]
pub struct WorkerDestroyer {
    token: CancellationToken,
}

impl WorkerDestroyer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn destroy(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn destroyed(&self) {
        self.token.cancelled().await;
    }
}

/// A launched worker.
#[async_trait]
pub trait Worker: Send {
    fn identity(&self) -> &WorkerIdentity;

    fn destroyer(&self) -> WorkerDestroyer;

    /// Waits for the worker to exit, returning its exit code.
    ///
    /// # Errors
    ///
    /// Returns an error when the exit cannot be observed.
    async fn wait_for(&mut self) -> Result<i32, EngineError>;
}

#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Launches one worker.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker cannot be started or initialised.
    async fn create(&self) -> Result<Box<dyn Worker>, EngineError>;
}

/// What every worker of one run is told at initialisation.
#[derive(Debug, Clone)]
pub struct WorkerSetup {
    pub report_to_console: bool,
    pub console_address: Option<String>,
    pub script: PathBuf,
    pub working_directory: PathBuf,
    pub interpreter: String,
    pub report_interval: Duration,
}

impl WorkerSetup {
    fn initialise(&self, identity: WorkerIdentity) -> Message {
        Message::InitialiseWorker(InitialiseWorker {
            identity,
            report_to_console: self.report_to_console,
            console_address: self.console_address.clone(),
            script: self.script.clone(),
            working_directory: self.working_directory.clone(),
            interpreter: self.interpreter.clone(),
            report_interval_ms: u64::try_from(self.report_interval.as_millis()).unwrap_or(u64::MAX),
        })
    }
}

/// Identity and stream plumbing shared by both factories.
struct FactoryContext {
    agent: AgentIdentity,
    sequence: Arc<WorkerIdentitySequence>,
    workers: Arc<FanOutSender>,
    setup: WorkerSetup,
}

impl FactoryContext {
    async fn attach<S>(
        &self,
        identity: &WorkerIdentity,
        stream: Arc<S>,
    ) -> Result<(), EngineError>
    where
        S: Sender + 'static,
    {
        stream
            .send(&self.setup.initialise(identity.clone()))
            .await
            .map_err(|err| EngineError::InitialiseWorker {
                worker: identity.name(),
                source: err,
            })?;
        self.workers.add(identity.number(), stream).await;
        Ok(())
    }
}

/// Launches each worker as a child process whose stdin carries agent
/// messages.
pub struct ProcessWorkerFactory {
    command_line: WorkerCommandLine,
    context: FactoryContext,
}

impl ProcessWorkerFactory {
    #[must_use]
    pub fn new(
        command_line: WorkerCommandLine,
        agent: AgentIdentity,
        sequence: Arc<WorkerIdentitySequence>,
        workers: Arc<FanOutSender>,
        setup: WorkerSetup,
    ) -> Self {
        Self {
            command_line,
            context: FactoryContext {
                agent,
                sequence,
                workers,
                setup,
            },
        }
    }
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    async fn create(&self) -> Result<Box<dyn Worker>, EngineError> {
        let identity = self.context.sequence.next_identity(&self.context.agent);
        let mut command = self.command_line.command();
        command.stdin(Stdio::piped()).kill_on_drop(true);
        let mut child = command.spawn().map_err(|err| EngineError::Spawn {
            command: self.command_line.to_string(),
            source: err,
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::MissingWorkerStream {
                command: self.command_line.to_string(),
            })?;
        let stream: Arc<StreamSender<ChildStdin>> = Arc::new(StreamSender::new(stdin));
        self.context.attach(&identity, stream).await?;
        debug!("Started worker process {}", identity);
        Ok(Box::new(ProcessWorker {
            identity,
            child,
            destroyer: WorkerDestroyer::new(),
            workers: Arc::clone(&self.context.workers),
        }))
    }
}

struct ProcessWorker {
    identity: WorkerIdentity,
    child: Child,
    destroyer: WorkerDestroyer,
    workers: Arc<FanOutSender>,
}

#[async_trait]
impl Worker for ProcessWorker {
    fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    fn destroyer(&self) -> WorkerDestroyer {
        self.destroyer.clone()
    }

    async fn wait_for(&mut self) -> Result<i32, EngineError> {
        let waited = tokio::select! {
            status = self.child.wait() => Some(status),
            () = self.destroyer.destroyed() => None,
        };
        let result = match waited {
            Some(Ok(status)) => Ok(status.code().unwrap_or(KILLED_EXIT_CODE)),
            Some(Err(err)) => Err(EngineError::WaitForWorker {
                worker: self.identity.name(),
                source: err,
            }),
            None => {
                if let Err(err) = self.child.kill().await {
                    warn!("Failed to kill worker {}: {}", self.identity, err);
                }
                Ok(KILLED_EXIT_CODE)
            }
        };
        self.workers.remove(self.identity.number()).await;
        result
    }
}

/// Runs each worker as a task inside the agent process, connected by an
/// in-memory pipe.
pub struct DebugWorkerFactory {
    context: FactoryContext,
}

impl DebugWorkerFactory {
    #[must_use]
    pub fn new(
        agent: AgentIdentity,
        sequence: Arc<WorkerIdentitySequence>,
        workers: Arc<FanOutSender>,
        setup: WorkerSetup,
    ) -> Self {
        Self {
            context: FactoryContext {
                agent,
                sequence,
                workers,
                setup,
            },
        }
    }
}

#[async_trait]
impl WorkerFactory for DebugWorkerFactory {
    async fn create(&self) -> Result<Box<dyn Worker>, EngineError> {
        let identity = self.context.sequence.next_identity(&self.context.agent);
        let (agent_end, worker_end) = tokio::io::duplex(DEBUG_PIPE_CAPACITY);
        let stream: Arc<StreamSender<DuplexStream>> = Arc::new(StreamSender::new(agent_end));
        self.context.attach(&identity, stream).await?;
        let task = tokio::spawn(run_worker(worker_end, CancellationToken::new()));
        debug!("Started worker task {}", identity);
        Ok(Box::new(DebugWorker {
            identity,
            task: Some(task),
            destroyer: WorkerDestroyer::new(),
            workers: Arc::clone(&self.context.workers),
        }))
    }
}

struct DebugWorker {
    identity: WorkerIdentity,
    task: Option<JoinHandle<AppResult<i32>>>,
    destroyer: WorkerDestroyer,
    workers: Arc<FanOutSender>,
}

#[async_trait]
impl Worker for DebugWorker {
    fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    fn destroyer(&self) -> WorkerDestroyer {
        self.destroyer.clone()
    }

    async fn wait_for(&mut self) -> Result<i32, EngineError> {
        let Some(mut task) = self.task.take() else {
            return Ok(KILLED_EXIT_CODE);
        };
        let code = tokio::select! {
            joined = &mut task => match joined {
                Ok(Ok(code)) => code,
                Ok(Err(err)) => {
                    warn!("Worker {} failed: {}", self.identity, err);
                    KILLED_EXIT_CODE
                }
                Err(err) => {
                    warn!("Worker task {} ended abnormally: {}", self.identity, err);
                    KILLED_EXIT_CODE
                }
            },
            () = self.destroyer.destroyed() => {
                task.abort();
                KILLED_EXIT_CODE
            }
        };
        self.workers.remove(self.identity.number()).await;
        Ok(code)
    }
}

