use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tempfile::tempdir;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::test_support::{FakeWorkerFactory, eventually};
use super::*;
use crate::args::{AgentArgs, PositiveUsize};
use crate::communication::{
    Acceptor, AddressedMessage, AgentProcessReport, ConnectionType, FileContents, Message,
    ProcessState, Sender, StartMessage, WorkerProcessReport,
};
use crate::error::{AppError, AppResult, EngineError};
use crate::test_support::run_async_test;

const WAIT: Duration = Duration::from_secs(10);
const SETTLE: Duration = Duration::from_millis(300);

struct FixedSettings(AgentSettings);

impl SettingsSource for FixedSettings {
    fn load(&self) -> AppResult<AgentSettings> {
        Ok(self.0.clone())
    }
}

fn start(script: &str) -> StartMessage {
    StartMessage {
        script: Some(PathBuf::from(script)),
    }
}

#[test]
fn console_script_must_live_in_the_file_store() -> AppResult<()> {
    let dir = tempdir()?;
    let store = FileStore::create(&dir.path().join("store"))?;
    std::fs::create_dir_all(store.directory().join("scripts"))?;
    std::fs::write(store.directory().join("scripts/load.sh"), "exit 0\n")?;
    std::fs::write(dir.path().join("escape.sh"), "exit 0\n")?;

    let location = resolve_script(Some(&start("scripts/load.sh")), &PathBuf::from("unused.sh"), Some(&store))?;
    if location.script != store.directory().join("scripts/load.sh")
        || location.directory != store.directory()
    {
        return Err(AppError::validation(format!("Unexpected location {:?}", location)));
    }

    let escaped = resolve_script(Some(&start("../escape.sh")), &PathBuf::from("unused.sh"), Some(&store));
    if !matches!(escaped, Err(EngineError::ScriptOutsideFileStore { .. })) {
        return Err(AppError::validation(format!("Expected escape rejected, got {:?}", escaped)));
    }

    let missing = resolve_script(Some(&start("missing.sh")), &PathBuf::from("unused.sh"), Some(&store));
    if !matches!(missing, Err(EngineError::ScriptNotReadable { .. })) {
        return Err(AppError::validation("Expected missing script rejected"));
    }

    let directory = resolve_script(Some(&start("scripts")), &PathBuf::from("unused.sh"), Some(&store));
    if !matches!(directory, Err(EngineError::ScriptNotAFile { .. })) {
        return Err(AppError::validation("Expected directory rejected"));
    }
    Ok(())
}

#[test]
fn local_script_runs_from_its_own_directory() -> AppResult<()> {
    let dir = tempdir()?;
    let script = dir.path().join("local.sh");
    std::fs::write(&script, "exit 0\n")?;

    let location = resolve_script(None, &script, None)?;
    if location.directory != dir.path().canonicalize()? {
        return Err(AppError::validation("Expected the script's directory"));
    }
    let without_script = resolve_script(Some(&StartMessage::default()), &script, None)?;
    if without_script != location {
        return Err(AppError::validation("Expected a start without script to use the local one"));
    }
    Ok(())
}

#[test]
fn unresponsive_workers_are_destroyed_after_the_grace_period() -> AppResult<()> {
    run_async_test(async {
        let events = Arc::new(Notify::new());
        let listener = ConsoleListener::new(Arc::clone(&events));
        let factory = Arc::new(FakeWorkerFactory::new());
        let launcher = WorkerLauncher::new(
            3,
            Arc::clone(&factory) as Arc<dyn WorkerFactory>,
            Arc::clone(&events),
        );
        launcher.start_some_workers(2).await?;
        listener.send(&Message::Stop).await?;

        let grace = Duration::from_millis(200);
        let started = std::time::Instant::now();
        let token = CancellationToken::new();
        let cancelled = tokio::time::timeout(
            Duration::from_secs(10),
            control_loop::supervise(&launcher, &listener, &events, grace, &token),
        )
        .await
        .map_err(|_err| AppError::validation("Supervision never finished"))?;

        if cancelled {
            return Err(AppError::validation("Did not expect cancellation"));
        }
        if started.elapsed() < grace {
            return Err(AppError::validation("Workers destroyed before the grace period"));
        }
        if factory.created().len() != 2 {
            return Err(AppError::validation("Expected no starts after the stop"));
        }
        if factory
            .created()
            .iter()
            .any(|worker| !worker.destroyer.is_destroyed())
        {
            return Err(AppError::validation("Expected every worker destroyed"));
        }
        if !listener.received(Signals::STOP) {
            return Err(AppError::validation("Expected the stop to be claimed"));
        }
        launcher.shutdown().await;
        Ok(())
    })
}

#[test]
fn workers_that_finish_end_supervision_without_force() -> AppResult<()> {
    run_async_test(async {
        let events = Arc::new(Notify::new());
        let listener = ConsoleListener::new(Arc::clone(&events));
        let factory = Arc::new(FakeWorkerFactory::new());
        let launcher = WorkerLauncher::new(
            2,
            Arc::clone(&factory) as Arc<dyn WorkerFactory>,
            Arc::clone(&events),
        );
        launcher.start_all_workers().await?;
        let finisher = Arc::clone(&factory);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            for worker in finisher.created() {
                worker.finish();
            }
        });

        let token = CancellationToken::new();
        tokio::time::timeout(
            Duration::from_secs(5),
            control_loop::supervise(&launcher, &listener, &events, Duration::from_secs(60), &token),
        )
        .await
        .map_err(|_err| AppError::validation("Supervision did not notice the exits"))?;
        if factory
            .created()
            .iter()
            .any(|worker| worker.destroyer.is_destroyed())
        {
            return Err(AppError::validation("Did not expect any worker destroyed"));
        }
        launcher.shutdown().await;
        Ok(())
    })
}

#[test]
fn cancellation_destroys_workers_immediately() -> AppResult<()> {
    run_async_test(async {
        let events = Arc::new(Notify::new());
        let listener = ConsoleListener::new(Arc::clone(&events));
        let factory = Arc::new(FakeWorkerFactory::new());
        let launcher = WorkerLauncher::new(
            2,
            Arc::clone(&factory) as Arc<dyn WorkerFactory>,
            Arc::clone(&events),
        );
        launcher.start_all_workers().await?;
        let token = CancellationToken::new();
        token.cancel();

        let cancelled = tokio::time::timeout(
            Duration::from_secs(5),
            control_loop::supervise(&launcher, &listener, &events, Duration::from_secs(60), &token),
        )
        .await
        .map_err(|_err| AppError::validation("Cancellation did not end supervision"))?;
        if !cancelled {
            return Err(AppError::validation("Expected cancellation reported"));
        }
        launcher.shutdown().await;
        Ok(())
    })
}

#[test]
fn consoleless_agent_runs_its_local_script_once() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let script = dir.path().join("local.sh");
        std::fs::write(&script, "exit 0\n")?;
        let args = AgentArgs {
            no_console: true,
            single_process: true,
            host_id: Some("local-agent".to_owned()),
            script: Some(script),
            processes: Some(PositiveUsize::try_from(2)?),
            file_store_directory: Some(dir.path().join("store")),
            ..AgentArgs::default()
        };
        let settings = FixedSettings(AgentSettings::resolve(&args, None)?);
        let mut control = ControlLoop::new(AgentIdentity::new("local-agent"), CancellationToken::new());

        let outcome = tokio::time::timeout(Duration::from_secs(20), control.run(&settings))
            .await
            .map_err(|_err| AppError::validation("Agent did not finish"))??;
        if outcome != LoopOutcome::Finished {
            return Err(AppError::validation(format!("Unexpected outcome {:?}", outcome)));
        }
        if dir.path().join("store").exists() {
            return Err(AppError::validation("File store created without a console"));
        }
        Ok(())
    })
}

/// Settings a test can change between control cycles.
struct SharedSettings(Mutex<AgentSettings>);

impl SharedSettings {
    fn lock(&self) -> MutexGuard<'_, AgentSettings> {
        match self.0.lock() {
            Ok(settings) => settings,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl SettingsSource for SharedSettings {
    fn load(&self) -> AppResult<AgentSettings> {
        Ok(self.lock().clone())
    }
}

/// A bare acceptor standing in for the console.
struct LoopbackConsole {
    acceptor: Acceptor,
    inbound: mpsc::UnboundedReceiver<AddressedMessage>,
}

impl LoopbackConsole {
    async fn bind() -> AppResult<Self> {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let acceptor = Acceptor::bind("127.0.0.1:0", inbound_tx).await?;
        Ok(Self { acceptor, inbound })
    }

    fn port(&self) -> u16 {
        self.acceptor.local_addr().port()
    }

    async fn broadcast(&self, message: Message) -> AppResult<()> {
        self.acceptor.agent_sender().send(&message).await?;
        Ok(())
    }

    /// Skips inbound messages until one matches.
    async fn expect<F>(&mut self, what: &str, mut matches: F) -> AppResult<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        loop {
            let addressed = tokio::time::timeout(WAIT, self.inbound.recv())
                .await
                .map_err(|_err| AppError::validation(format!("Timed out waiting for {}", what)))?
                .ok_or_else(|| AppError::validation("Inbound channel closed"))?;
            if matches(&addressed.message) {
                return Ok(addressed.message);
            }
        }
    }

    async fn agent_started(&mut self, name: &str) -> AppResult<()> {
        self.expect(&format!("agent {} to start", name), |message| {
            matches!(
                message,
                Message::AgentProcessReport(AgentProcessReport {
                    identity,
                    state: ProcessState::Started,
                    ..
                }) if identity.name() == name
            )
        })
        .await?;
        Ok(())
    }

    /// Waits for a worker to report its exit, then for the agent to settle
    /// back into waiting for the console.
    async fn worker_finished(&mut self) -> AppResult<()> {
        self.expect("a worker to finish", |message| {
            matches!(
                message,
                Message::WorkerProcessReport(WorkerProcessReport {
                    state: ProcessState::Finished,
                    ..
                })
            )
        })
        .await?;
        eventually("the worker connection to close", || {
            self.acceptor.number_of_connections(ConnectionType::Worker) == 0
        })
        .await?;
        tokio::time::sleep(SETTLE).await;
        Ok(())
    }

    async fn shutdown(self) {
        self.acceptor.shutdown().await;
    }
}

fn console_settings(port: u16, root: &Path, host_id: &str) -> AppResult<AgentSettings> {
    let args = AgentArgs {
        console_host: Some("127.0.0.1".to_owned()),
        console_port: Some(port),
        host_id: Some(host_id.to_owned()),
        script: Some(root.join("unused.sh")),
        processes: Some(PositiveUsize::try_from(1)?),
        single_process: true,
        shutdown_grace: Some(Duration::from_secs(2)),
        file_store_directory: Some(root.join("store")),
        ..AgentArgs::default()
    };
    AgentSettings::resolve(&args, None)
}

fn spawn_control_loop(
    name: &str,
    settings: &Arc<SharedSettings>,
) -> (JoinHandle<AppResult<LoopOutcome>>, CancellationToken) {
    let token = CancellationToken::new();
    let mut control = ControlLoop::new(AgentIdentity::new(name), token.clone());
    let source = Arc::clone(settings);
    let handle = tokio::spawn(async move { control.run(&*source).await });
    (handle, token)
}

async fn outcome(handle: JoinHandle<AppResult<LoopOutcome>>) -> AppResult<LoopOutcome> {
    tokio::time::timeout(WAIT, handle)
        .await
        .map_err(|_err| AppError::validation("Control loop did not end"))??
}

fn runs(store: &Path) -> usize {
    std::fs::read_to_string(store.join("runs.txt"))
        .map(|runs| runs.lines().count())
        .unwrap_or(0)
}

fn distribute_script(contents: &str) -> AppResult<Message> {
    Ok(Message::DistributeFile(FileContents::new(
        "count.sh",
        contents.as_bytes().to_vec(),
    )?))
}

fn start_script() -> Message {
    Message::Start(start("count.sh"))
}

#[test]
fn idle_agent_follows_start_reset_and_stop() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let store = dir.path().join("store");
        let mut console = LoopbackConsole::bind().await?;
        let settings = Arc::new(SharedSettings(Mutex::new(console_settings(
            console.port(),
            dir.path(),
            "agent-a",
        )?)));
        let (handle, _token) = spawn_control_loop("agent-a", &settings);
        console.agent_started("agent-a").await?;

        console.broadcast(distribute_script("echo run >> runs.txt\n")?).await?;
        console.broadcast(start_script()).await?;
        console.worker_finished().await?;
        if runs(&store) != 1 {
            return Err(AppError::validation("Expected one run after the first start"));
        }

        console.broadcast(start_script()).await?;
        console.worker_finished().await?;
        if runs(&store) != 2 {
            return Err(AppError::validation("Expected a start after a run to run again"));
        }

        console.broadcast(Message::Reset).await?;
        tokio::time::sleep(SETTLE).await;
        if handle.is_finished() || runs(&store) != 2 {
            return Err(AppError::validation("Expected a reset to leave the agent waiting"));
        }

        console.broadcast(Message::Stop).await?;
        let ended = outcome(handle).await?;
        if ended != LoopOutcome::Stopped {
            return Err(AppError::validation(format!("Unexpected outcome {:?}", ended)));
        }
        console.shutdown().await;
        Ok(())
    })
}

#[test]
fn start_during_a_run_is_discarded() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let store = dir.path().join("store");
        let mut console = LoopbackConsole::bind().await?;
        let settings = Arc::new(SharedSettings(Mutex::new(console_settings(
            console.port(),
            dir.path(),
            "agent-a",
        )?)));
        let (handle, _token) = spawn_control_loop("agent-a", &settings);
        console.agent_started("agent-a").await?;

        console
            .broadcast(distribute_script("echo run >> runs.txt\nsleep 1\n")?)
            .await?;
        console.broadcast(start_script()).await?;
        eventually("the run to begin", || runs(&store) == 1).await?;
        console.broadcast(start_script()).await?;
        console.worker_finished().await?;
        tokio::time::sleep(SETTLE).await;
        if runs(&store) != 1 {
            return Err(AppError::validation("Expected the start during the run ignored"));
        }

        console.broadcast(Message::Stop).await?;
        if outcome(handle).await? != LoopOutcome::Stopped {
            return Err(AppError::validation("Expected a stop while idle to end the loop"));
        }
        console.shutdown().await;
        Ok(())
    })
}

#[test]
fn link_is_rebuilt_when_the_name_or_console_changes() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let mut first = LoopbackConsole::bind().await?;
        let mut second = LoopbackConsole::bind().await?;
        let settings = Arc::new(SharedSettings(Mutex::new(console_settings(
            first.port(),
            dir.path(),
            "agent-a",
        )?)));
        let (handle, _token) = spawn_control_loop("agent-a", &settings);
        first.agent_started("agent-a").await?;

        settings.lock().host_id = "agent-b".to_owned();
        first.broadcast(Message::Reset).await?;
        first.agent_started("agent-b").await?;

        settings.lock().console_port = second.port();
        first.broadcast(Message::Reset).await?;
        second.agent_started("agent-b").await?;
        eventually("the first link to close", || {
            first.acceptor.number_of_connections(ConnectionType::Agent) == 0
        })
        .await?;

        second.broadcast(Message::Stop).await?;
        if outcome(handle).await? != LoopOutcome::Stopped {
            return Err(AppError::validation("Expected the new console to stop the agent"));
        }
        first.shutdown().await;
        second.shutdown().await;
        Ok(())
    })
}

#[test]
fn unreachable_console_ends_a_standby_loop() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let port = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();
        std::fs::write(dir.path().join("unused.sh"), "exit 0\n")?;
        let mut standby = console_settings(port, dir.path(), "agent-a")?;
        standby.standby = true;
        let settings = Arc::new(SharedSettings(Mutex::new(standby)));

        let (standby_run, _standby_token) = spawn_control_loop("agent-a", &settings);
        if outcome(standby_run).await? != LoopOutcome::ConsoleShutdown {
            return Err(AppError::validation("Expected a standby agent to wait for its console"));
        }

        settings.lock().standby = false;
        let (local_run, _local_token) = spawn_control_loop("agent-a", &settings);
        if outcome(local_run).await? != LoopOutcome::Finished {
            return Err(AppError::validation("Expected a console-less run otherwise"));
        }
        Ok(())
    })
}
