use std::fmt;
use std::path::PathBuf;

use tokio::process::Command;

use crate::config::AgentSettings;
use crate::error::AppResult;

const WORKER_SUBCOMMAND: &str = "worker";

/// Program and arguments used to launch a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommandLine {
    program: PathBuf,
    arguments: Vec<String>,
}

impl WorkerCommandLine {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, arguments: Vec<String>) -> Self {
        Self {
            program: program.into(),
            arguments,
        }
    }

    /// The configured worker command, or this executable's hidden `worker`
    /// subcommand. Extra worker arguments follow either.
    ///
    /// # Errors
    ///
    /// Returns an error when no worker command is configured and the path of
    /// the running executable cannot be determined.
    pub fn from_settings(settings: &AgentSettings) -> AppResult<Self> {
        if let Some(program) = &settings.worker_command {
            return Ok(Self::new(program.clone(), settings.worker_arguments.clone()));
        }
        let mut arguments = Vec::with_capacity(settings.worker_arguments.len().saturating_add(1));
        arguments.push(WORKER_SUBCOMMAND.to_owned());
        arguments.extend(settings.worker_arguments.iter().cloned());
        Ok(Self::new(std::env::current_exe()?, arguments))
    }

    #[must_use]
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.arguments);
        command
    }
}

impl fmt::Display for WorkerCommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for argument in &self.arguments {
            if argument.contains(char::is_whitespace) {
                write!(f, " '{}'", argument)?;
            } else {
                write!(f, " {}", argument)?;
            }
        }
        Ok(())
    }
}
