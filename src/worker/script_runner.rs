use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::EngineError;

/// Starts the process that executes a load-test script.
pub trait ScriptRunner: Send + Sync {
    /// Launches `script` with `working_directory` as its current directory.
    ///
    /// # Errors
    ///
    /// Returns an error when the script process cannot be started.
    fn spawn(&self, script: &Path, working_directory: &Path) -> Result<Child, EngineError>;
}

/// Runs scripts through an interpreter command line such as `sh` or
/// `python3 -u`.
#[derive(Debug, Clone)]
pub struct CommandScriptRunner {
    interpreter: String,
}

impl CommandScriptRunner {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl ScriptRunner for CommandScriptRunner {
    fn spawn(&self, script: &Path, working_directory: &Path) -> Result<Child, EngineError> {
        let mut parts = self.interpreter.split_whitespace();
        let program = parts.next().unwrap_or("sh");
        let mut command = Command::new(program);
        command
            .args(parts)
            .arg(script)
            .current_dir(working_directory)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command.spawn().map_err(|err| EngineError::ScriptSpawn {
            path: script.to_path_buf(),
            interpreter: self.interpreter.clone(),
            source: err,
        })
    }
}
