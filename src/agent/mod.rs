//! The agent: connects to a console, keeps a file store in sync, and runs
//! populations of workers on the console's instruction.
mod command_line;
mod console_link;
mod console_listener;
mod control_loop;
mod file_store;
mod launcher;
mod ramp_up;
mod worker;

#[cfg(test)]
mod test_support;
#[cfg(test)]
mod tests;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::args::AgentArgs;
use crate::config::{AgentSettings, load_config};
use crate::error::AppResult;
use crate::identity::AgentIdentity;

pub use command_line::WorkerCommandLine;
pub use console_link::{ConsoleLink, LinkContext};
pub use console_listener::{ConsoleListener, Signals};
pub use control_loop::{ControlLoop, LoopOutcome, ScriptLocation, SettingsSource, resolve_script};
pub use file_store::FileStore;
pub use launcher::WorkerLauncher;
pub use ramp_up::{RampUp, start_workers};
pub use worker::{
    DebugWorkerFactory, ProcessWorkerFactory, Worker, WorkerDestroyer, WorkerFactory, WorkerSetup,
};

/// Settings re-read from the config file for every control cycle, with CLI
/// arguments taking precedence.
pub struct ConfiguredSettings {
    args: AgentArgs,
    config_path: Option<String>,
}

impl ConfiguredSettings {
    #[must_use]
    pub const fn new(args: AgentArgs, config_path: Option<String>) -> Self {
        Self { args, config_path }
    }
}

impl SettingsSource for ConfiguredSettings {
    fn load(&self) -> AppResult<AgentSettings> {
        let config = load_config(self.config_path.as_deref())?;
        AgentSettings::resolve(&self.args, config.as_ref())
    }
}

/// Runs the agent until the console stops it or `token` is cancelled.
///
/// In standby mode a lost console connection is retried after the reconnect
/// delay.
///
/// # Errors
///
/// Returns an error when the settings cannot be loaded.
pub async fn run_agent(source: &dyn SettingsSource, token: CancellationToken) -> AppResult<()> {
    let settings = source.load()?;
    info!(
        "Agent {} starting (standby={}, reconnect={}ms)",
        settings.host_id,
        settings.standby,
        settings.reconnect_delay.as_millis()
    );
    let mut control = ControlLoop::new(AgentIdentity::new(settings.host_id), token.clone());

    loop {
        let outcome = control.run(source).await?;
        let settings = source.load()?;
        match outcome {
            LoopOutcome::ConsoleShutdown if settings.standby => {
                warn!(
                    "Lost the console, reconnecting in {}ms",
                    settings.reconnect_delay.as_millis()
                );
                tokio::select! {
                    () = tokio::time::sleep(settings.reconnect_delay) => {}
                    () = token.cancelled() => return Ok(()),
                }
            }
            LoopOutcome::ConsoleShutdown
            | LoopOutcome::Finished
            | LoopOutcome::Stopped
            | LoopOutcome::Cancelled => {
                info!("Agent finished ({:?})", outcome);
                return Ok(());
            }
        }
    }
}
