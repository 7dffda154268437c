use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::communication::{ConnectionType, Connector, FanOutSender, StartMessage};
use crate::config::AgentSettings;
use crate::error::{AppResult, CommunicationError, EngineError};
use crate::identity::{AgentIdentity, WorkerIdentitySequence};

use super::command_line::WorkerCommandLine;
use super::console_link::{ConsoleLink, LinkContext};
use super::console_listener::{ConsoleListener, Signals};
use super::file_store::FileStore;
use super::launcher::WorkerLauncher;
use super::ramp_up::start_workers;
use super::worker::{DebugWorkerFactory, ProcessWorkerFactory, WorkerFactory, WorkerSetup};

/// Supplies the agent's settings at the start of every control cycle.
pub trait SettingsSource: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the settings cannot be loaded.
    fn load(&self) -> AppResult<AgentSettings>;
}

/// Why a control loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Ran once without a console.
    Finished,
    /// The console sent a stop.
    Stopped,
    /// The console connection went away.
    ConsoleShutdown,
    /// The agent's cancellation token fired.
    Cancelled,
}

/// Script to run and the directory workers run it from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLocation {
    pub script: PathBuf,
    pub directory: PathBuf,
}

/// The agent's long-lived state across control cycles.
pub struct ControlLoop {
    identity: AgentIdentity,
    sequence: Arc<WorkerIdentitySequence>,
    events: Arc<Notify>,
    listener: Arc<ConsoleListener>,
    workers: Arc<FanOutSender>,
    link: Option<ConsoleLink>,
    file_store: Option<Arc<FileStore>>,
    token: CancellationToken,
}

impl ControlLoop {
    #[must_use]
    pub fn new(identity: AgentIdentity, token: CancellationToken) -> Self {
        let events = Arc::new(Notify::new());
        Self {
            identity,
            sequence: Arc::new(WorkerIdentitySequence::new()),
            listener: Arc::new(ConsoleListener::new(Arc::clone(&events))),
            events,
            workers: Arc::new(FanOutSender::new()),
            link: None,
            file_store: None,
            token,
        }
    }

    /// Runs control cycles until the console stops the agent, the console
    /// goes away, or the agent is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error when the settings cannot be loaded.
    pub async fn run(&mut self, source: &dyn SettingsSource) -> AppResult<LoopOutcome> {
        let outcome = self.cycles(source).await;
        if let Some(link) = self.link.take() {
            link.shutdown().await;
        }
        self.listener.discard_messages(Signals::ANY);
        outcome
    }

    async fn cycles(&mut self, source: &dyn SettingsSource) -> AppResult<LoopOutcome> {
        let mut next_start: Option<StartMessage> = None;
        loop {
            if self.token.is_cancelled() {
                return Ok(LoopOutcome::Cancelled);
            }
            let settings = source.load()?;
            if settings.host_id != self.identity.name() {
                self.identity.set_name(settings.host_id.clone());
            }
            if let Err(err) = self.update_link(&settings).await {
                if settings.standby {
                    warn!("{}; console unavailable", err);
                    return Ok(LoopOutcome::ConsoleShutdown);
                }
                error!(
                    "{}, proceeding without the console; set use_console = false to disable this warning",
                    err
                );
            }

            if self.link.is_some() && next_start.is_none() {
                info!("Waiting for console signal");
                if !self.wait_for_signal().await {
                    return Ok(LoopOutcome::Cancelled);
                }
            }

            if self.link.is_none() || next_start.is_some() || self.listener.received(Signals::START)
            {
                let start = if self.link.is_some() {
                    next_start.clone().or_else(|| self.listener.last_start())
                } else {
                    None
                };
                let store = self.file_store.as_deref();
                match resolve_script(start.as_ref(), &settings.script, store) {
                    Ok(location) => {
                        if !self.run_workers(&settings, location).await {
                            return Ok(LoopOutcome::Cancelled);
                        }
                    }
                    Err(err) => error!("{}; no workers started", err),
                }
            }

            if self.link.is_none() {
                return Ok(LoopOutcome::Finished);
            }
            self.listener.discard_messages(Signals::START);
            if !self.listener.received(Signals::ANY) {
                info!("Finished, waiting for console signal");
                if !self.wait_for_signal().await {
                    return Ok(LoopOutcome::Cancelled);
                }
            }

            if self.listener.received(Signals::START) {
                next_start = self.listener.last_start();
            } else if self.listener.received(Signals::STOP) {
                return Ok(LoopOutcome::Stopped);
            } else if self.listener.received(Signals::SHUTDOWN) {
                return Ok(LoopOutcome::ConsoleShutdown);
            } else {
                next_start = None;
            }
        }
    }

    /// Connects to the configured console unless the current link already
    /// matches it.
    async fn update_link(&mut self, settings: &AgentSettings) -> Result<(), CommunicationError> {
        if !settings.use_console {
            self.close_link().await;
            return Ok(());
        }
        let connector = Connector::new(
            settings.console_host.clone(),
            settings.console_port,
            ConnectionType::Agent,
        );
        let unchanged = self.link.as_ref().is_some_and(|link| {
            *link.connector() == connector && link.agent_name() == self.identity.name()
        });
        if unchanged {
            return Ok(());
        }
        self.close_link().await;

        let (stream, _details) = connector.connect().await?;
        let file_store = self.file_store(settings)?;
        let context = LinkContext {
            identity: self.identity.clone(),
            file_store,
            listener: Arc::clone(&self.listener),
            workers: Arc::clone(&self.workers),
            report_interval: settings.report_interval,
        };
        self.link = Some(ConsoleLink::start(connector, stream, context).await);
        Ok(())
    }

    async fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.shutdown().await;
            self.listener.discard_messages(Signals::SHUTDOWN);
        }
    }

    fn file_store(&mut self, settings: &AgentSettings) -> Result<Arc<FileStore>, CommunicationError> {
        if let Some(file_store) = &self.file_store {
            return Ok(Arc::clone(file_store));
        }
        let file_store = Arc::new(FileStore::create(&settings.file_store_directory)?);
        self.file_store = Some(Arc::clone(&file_store));
        Ok(file_store)
    }

    async fn wait_for_signal(&self) -> bool {
        tokio::select! {
            () = self.listener.wait_for_message() => true,
            () = self.token.cancelled() => false,
        }
    }

    /// Runs one population of workers. Returns `false` when the agent was
    /// cancelled meanwhile.
    async fn run_workers(&self, settings: &AgentSettings, location: ScriptLocation) -> bool {
        let console_address = self.link.as_ref().map(|link| link.connector().address());
        let setup = WorkerSetup {
            report_to_console: console_address.is_some(),
            console_address,
            script: location.script,
            working_directory: location.directory,
            interpreter: settings.worker.interpreter.clone(),
            report_interval: settings.worker.report_interval,
        };
        let factory: Arc<dyn WorkerFactory> = if settings.single_process {
            info!("Debug mode: running workers as tasks rather than processes");
            Arc::new(DebugWorkerFactory::new(
                self.identity.clone(),
                Arc::clone(&self.sequence),
                Arc::clone(&self.workers),
                setup,
            ))
        } else {
            let command_line = match WorkerCommandLine::from_settings(settings) {
                Ok(command_line) => command_line,
                Err(err) => {
                    error!("Cannot build the worker command line: {}", err);
                    return true;
                }
            };
            info!("Worker process command line: {}", command_line);
            Arc::new(ProcessWorkerFactory::new(
                command_line,
                self.identity.clone(),
                Arc::clone(&self.sequence),
                Arc::clone(&self.workers),
                setup,
            ))
        };

        let launcher = Arc::new(WorkerLauncher::new(
            settings.processes,
            factory,
            Arc::clone(&self.events),
        ));
        let ramp_up = match start_workers(
            &launcher,
            settings.initial_processes(),
            settings.process_increment,
            settings.process_increment_interval,
        )
        .await
        {
            Ok(ramp_up) => ramp_up,
            Err(err) => {
                error!("Failed to start workers: {}", err);
                launcher.dont_start_any_more();
                None
            }
        };

        let cancelled = supervise(
            &launcher,
            &self.listener,
            &self.events,
            settings.shutdown_grace,
            &self.token,
        )
        .await;
        if let Some(ramp_up) = ramp_up {
            ramp_up.cancel().await;
        }
        launcher.shutdown().await;
        !cancelled
    }
}

/// Waits for every worker to finish.
///
/// The first non-start console signal stops further starts; workers still
/// running `grace` later are destroyed. Cancelling `token` destroys workers
/// at once. Returns whether `token` was cancelled.
pub(crate) async fn supervise(
    launcher: &WorkerLauncher,
    listener: &ConsoleListener,
    events: &Notify,
    grace: Duration,
    token: &CancellationToken,
) -> bool {
    let mut signalled_at: Option<Instant> = None;
    let mut forced = false;
    loop {
        let notified = events.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if launcher.all_finished() {
            return token.is_cancelled();
        }
        if token.is_cancelled() && !forced {
            info!("Agent shutting down, destroying workers");
            launcher.destroy_all_workers();
            forced = true;
        }
        if signalled_at.is_none()
            && listener.check_for_message(Signals::ANY.without(Signals::START))
        {
            launcher.dont_start_any_more();
            signalled_at = Some(Instant::now());
        }

        let mut timeout = grace;
        if let Some(at) = signalled_at
            && !forced
        {
            let elapsed = at.elapsed();
            if elapsed >= grace {
                warn!("Forcibly terminating unresponsive processes");
                launcher.destroy_all_workers();
                forced = true;
            } else {
                timeout = grace.saturating_sub(elapsed);
            }
        }

        tokio::select! {
            () = notified => {}
            () = tokio::time::sleep(timeout) => {}
            () = token.cancelled(), if !forced => {}
        }
    }
}

/// Finds the script for a run.
///
/// A script named by the console must be a readable file inside the file
/// store and runs from the store directory. Otherwise the local script runs
/// from its own directory.
///
/// # Errors
///
/// Returns an error when the script is missing, unreadable, not a file, or
/// outside the file store.
pub fn resolve_script(
    start: Option<&StartMessage>,
    local_script: &Path,
    file_store: Option<&FileStore>,
) -> Result<ScriptLocation, EngineError> {
    if let Some(script) = start.and_then(|start| start.script.as_ref()) {
        let Some(file_store) = file_store else {
            return Err(EngineError::ScriptOutsideFileStore {
                path: script.clone(),
                store: PathBuf::new(),
            });
        };
        let store = file_store.directory();
        let resolved = readable_file(&store.join(script))?;
        if !resolved.starts_with(store) {
            return Err(EngineError::ScriptOutsideFileStore {
                path: script.clone(),
                store: store.to_path_buf(),
            });
        }
        return Ok(ScriptLocation {
            script: resolved,
            directory: store.to_path_buf(),
        });
    }

    let resolved = readable_file(local_script)?;
    let directory = resolved
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    Ok(ScriptLocation {
        script: resolved,
        directory,
    })
}

fn readable_file(path: &Path) -> Result<PathBuf, EngineError> {
    let not_readable = |err| EngineError::ScriptNotReadable {
        path: path.to_path_buf(),
        source: err,
    };
    let resolved = path.canonicalize().map_err(not_readable)?;
    if !resolved.is_file() {
        return Err(EngineError::ScriptNotAFile {
            path: path.to_path_buf(),
        });
    }
    std::fs::File::open(&resolved).map_err(not_readable)?;
    Ok(resolved)
}
