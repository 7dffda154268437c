use std::path::PathBuf;
use std::str::FromStr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::communication::ProcessState;
use crate::error::{AppResult, ValidationError};

use super::Console;
use super::process_status::{ProcessReports, StatusUpdate};

/// One line of operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Start workers, optionally with a script from the distributed files.
    Start(Option<PathBuf>),
    Stop,
    Reset,
    Distribute,
    Status,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = ValidationError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (command, argument) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(command, rest)| (command, rest.trim()));
        let without_argument = |parsed: Self, name: &'static str| {
            if argument.is_empty() {
                Ok(parsed)
            } else {
                Err(ValidationError::UnexpectedCommandArgument { command: name })
            }
        };
        match command.to_ascii_lowercase().as_str() {
            "start" => Ok(ConsoleCommand::Start(
                (!argument.is_empty()).then(|| PathBuf::from(argument)),
            )),
            "stop" => without_argument(ConsoleCommand::Stop, "stop"),
            "reset" => without_argument(ConsoleCommand::Reset, "reset"),
            "distribute" => without_argument(ConsoleCommand::Distribute, "distribute"),
            "status" => without_argument(ConsoleCommand::Status, "status"),
            "quit" | "exit" => without_argument(ConsoleCommand::Quit, "quit"),
            _ => Err(ValidationError::UnknownCommand {
                value: command.to_owned(),
            }),
        }
    }
}

/// Executes operator commands read from `input` until `quit`, the end of
/// the input followed by cancellation, or cancellation of `token`.
///
/// A failing command is logged and the loop carries on.
///
/// # Errors
///
/// Returns an error when reading `input` fails.
pub async fn run_commands<R>(console: &Console, input: R, token: &CancellationToken) -> AppResult<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            () = token.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            info!("Command input closed; console runs until interrupted");
            token.cancelled().await;
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<ConsoleCommand>() {
            Ok(ConsoleCommand::Quit) => return Ok(()),
            Ok(command) => {
                if let Err(err) = execute(console, command).await {
                    error!("{}", err);
                }
            }
            Err(err) => warn!("{}", err),
        }
    }
}

async fn execute(console: &Console, command: ConsoleCommand) -> AppResult<()> {
    let control = console.process_control();
    match command {
        ConsoleCommand::Start(script) => control.start_worker_processes(script).await?,
        ConsoleCommand::Stop => control.stop_agent_and_worker_processes().await?,
        ConsoleCommand::Reset => control.reset_worker_processes().await?,
        ConsoleCommand::Distribute => {
            let sent = console.distribute_files().await?;
            info!("Distribution finished, {} files sent", sent);
        }
        ConsoleCommand::Status => log_status(&console.process_status().snapshot()),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

fn log_status(reports: &[ProcessReports]) {
    if reports.is_empty() {
        info!("No agents connected");
        return;
    }
    for agent in reports {
        info!(
            "{} [{}] {}",
            agent.agent.identity,
            agent.agent.state,
            summarise_workers(agent)
        );
    }
}

fn summarise_workers(reports: &ProcessReports) -> String {
    let count = |state: ProcessState| {
        reports
            .workers
            .iter()
            .filter(|worker| worker.state == state)
            .count()
    };
    format!(
        "workers: {} started, {} running, {} finished",
        count(ProcessState::Started),
        count(ProcessState::Running),
        count(ProcessState::Finished)
    )
}

/// Logs status snapshots as they arrive until `token` is cancelled.
#[must_use]
pub fn spawn_status_logger(
    mut updates: mpsc::Receiver<StatusUpdate>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let update = tokio::select! {
                () = token.cancelled() => break,
                update = updates.recv() => update,
            };
            let Some(update) = update else {
                break;
            };
            if update.agent_count_changed {
                info!("{} agents connected", update.reports.len());
            }
            for reports in update.reports.iter() {
                debug!(
                    "{} [{}] {}",
                    reports.agent.identity,
                    reports.agent.state,
                    summarise_workers(reports)
                );
            }
        }
    })
}
