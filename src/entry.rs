use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::agent::{ConfiguredSettings, run_agent};
use crate::args::{Command, LoadfleetArgs};
use crate::config::{ConsoleSettings, load_config};
use crate::console::run_console;
use crate::error::AppResult;
use crate::shutdown::setup_signal_shutdown_handler;
use crate::worker::run_worker;

/// Tasks still blocked on stdin are abandoned after this long.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Parses the command line and runs the chosen role to completion.
///
/// A worker exits the process with its script's exit code.
///
/// # Errors
///
/// Returns an error when the runtime cannot be built or the role fails.
pub fn run() -> AppResult<()> {
    let args = LoadfleetArgs::parse();

    crate::logger::init_logging(args.verbose, args.no_color);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let outcome = runtime.block_on(run_async(args));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    match outcome? {
        Some(exit_code) => std::process::exit(exit_code),
        None => Ok(()),
    }
}

async fn run_async(args: LoadfleetArgs) -> AppResult<Option<i32>> {
    let token = CancellationToken::new();
    let signals = setup_signal_shutdown_handler(&token);
    let outcome = run_role(args, &token).await;
    token.cancel();
    if let Err(err) = signals.await {
        eprintln!("Signal handler failed: {}", err);
    }
    outcome
}

async fn run_role(args: LoadfleetArgs, token: &CancellationToken) -> AppResult<Option<i32>> {
    match args.command {
        Command::Agent(agent_args) => {
            let settings = ConfiguredSettings::new(agent_args, args.config);
            run_agent(&settings, token.clone()).await?;
            Ok(None)
        }
        Command::Console(console_args) => {
            let config = load_config(args.config.as_deref())?;
            let settings = ConsoleSettings::resolve(&console_args, config.as_ref())?;
            run_console(&settings, token.clone()).await?;
            Ok(None)
        }
        Command::Worker => {
            let exit_code = run_worker(tokio::io::stdin(), token.clone()).await?;
            Ok(Some(exit_code))
        }
    }
}
