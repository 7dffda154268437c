use std::path::PathBuf;
use std::time::Duration;

use crate::args::{AgentArgs, ConsoleArgs};
use crate::error::{AppError, AppResult, ConfigError, ValidationError};
use crate::identity::local_host_name;

use super::types::{AgentConfig, ConfigFile, ConsoleConfig, DurationValue, WorkerConfig};

pub const DEFAULT_CONSOLE_PORT: u16 = 6372;
const DEFAULT_CONSOLE_HOST: &str = "127.0.0.1";
const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
const DEFAULT_SCRIPT: &str = "script.sh";
const DEFAULT_INTERPRETER: &str = "sh";
const DEFAULT_PROCESSES: usize = 1;
const DEFAULT_INCREMENT_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(20);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(2000);

/// Names never distributed: editor backups, lock files, compiled output,
/// worker logs and version control directories. Directories are matched
/// with a trailing `/`.
pub const DEFAULT_DISTRIBUTION_FILTER: &str = r"^CVS/$|^\.svn/$|^\.git/$|^\.hg/$|^.*~$|^#.*#$|^\.#.*$|^.*\.pyc$|^.*\.class$|^(out|error|data)_.*\.log\d*$";

/// Settings an agent uses for one control cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub use_console: bool,
    pub console_host: String,
    pub console_port: u16,
    pub host_id: String,
    pub script: PathBuf,
    pub processes: usize,
    pub initial_processes: Option<usize>,
    pub process_increment: usize,
    pub process_increment_interval: Duration,
    pub shutdown_grace: Duration,
    pub single_process: bool,
    pub worker_command: Option<PathBuf>,
    pub worker_arguments: Vec<String>,
    pub file_store_directory: PathBuf,
    pub standby: bool,
    pub reconnect_delay: Duration,
    pub report_interval: Duration,
    pub worker: WorkerSettings,
}

/// Settings handed to each worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub interpreter: String,
    pub report_interval: Duration,
}

impl AgentSettings {
    /// Merges CLI arguments over the config file over defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when a configured value is out of range.
    pub fn resolve(args: &AgentArgs, config: Option<&ConfigFile>) -> AppResult<Self> {
        let empty = AgentConfig::default();
        let file = config.and_then(|config| config.agent.as_ref()).unwrap_or(&empty);

        let host_id = args
            .host_id
            .clone()
            .or_else(|| file.host_id.clone())
            .unwrap_or_else(local_host_name);
        let processes = match args.processes {
            Some(processes) => processes.get(),
            None => positive_field("agent.processes", file.processes)?.unwrap_or(DEFAULT_PROCESSES),
        };
        let initial_processes = match args.initial_processes {
            Some(initial) => Some(initial.get()),
            None => positive_field("agent.initial_processes", file.initial_processes)?,
        };
        let file_store_directory = args
            .file_store_directory
            .clone()
            .or_else(|| file.file_store_directory.clone())
            .unwrap_or_else(|| PathBuf::from(format!("./{}-file-store", host_id)));

        Ok(Self {
            use_console: !args.no_console && file.use_console.unwrap_or(true),
            console_host: args
                .console_host
                .clone()
                .or_else(|| file.console_host.clone())
                .unwrap_or_else(|| DEFAULT_CONSOLE_HOST.to_owned()),
            console_port: args
                .console_port
                .or(file.console_port)
                .unwrap_or(DEFAULT_CONSOLE_PORT),
            script: args
                .script
                .clone()
                .or_else(|| file.script.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SCRIPT)),
            processes,
            initial_processes,
            process_increment: args
                .process_increment
                .or(file.process_increment)
                .unwrap_or(0),
            process_increment_interval: duration_field(
                "agent.process_increment_interval",
                args.process_increment_interval,
                file.process_increment_interval.as_ref(),
                DEFAULT_INCREMENT_INTERVAL,
            )?,
            shutdown_grace: duration_field(
                "agent.shutdown_grace",
                args.shutdown_grace,
                file.shutdown_grace.as_ref(),
                DEFAULT_SHUTDOWN_GRACE,
            )?,
            single_process: args.single_process || file.single_process.unwrap_or(false),
            worker_command: args
                .worker_command
                .clone()
                .or_else(|| file.worker_command.clone()),
            worker_arguments: if args.worker_arguments.is_empty() {
                file.worker_arguments.clone().unwrap_or_default()
            } else {
                args.worker_arguments.clone()
            },
            file_store_directory,
            standby: args.standby || file.standby.unwrap_or(false),
            reconnect_delay: duration_field(
                "agent.reconnect_delay",
                args.reconnect_delay,
                file.reconnect_delay.as_ref(),
                DEFAULT_RECONNECT_DELAY,
            )?,
            report_interval: duration_field(
                "agent.report_interval",
                None,
                file.report_interval.as_ref(),
                DEFAULT_REPORT_INTERVAL,
            )?,
            worker: WorkerSettings::resolve(config.and_then(|config| config.worker.as_ref()))?,
            host_id,
        })
    }

    #[must_use]
    pub fn console_address(&self) -> String {
        format!("{}:{}", self.console_host, self.console_port)
    }

    /// Workers started before ramp-up begins.
    #[must_use]
    pub fn initial_processes(&self) -> usize {
        self.initial_processes
            .unwrap_or(self.process_increment)
            .min(self.processes)
    }

    /// Whether workers are started in timed increments.
    #[must_use]
    pub const fn ramps_up(&self) -> bool {
        self.process_increment > 0 && self.process_increment < self.processes
    }
}

impl WorkerSettings {
    fn resolve(config: Option<&WorkerConfig>) -> AppResult<Self> {
        let empty = WorkerConfig::default();
        let file = config.unwrap_or(&empty);
        Ok(Self {
            interpreter: file
                .interpreter
                .clone()
                .unwrap_or_else(|| DEFAULT_INTERPRETER.to_owned()),
            report_interval: duration_field(
                "worker.report_interval",
                None,
                file.report_interval.as_ref(),
                DEFAULT_REPORT_INTERVAL,
            )?,
        })
    }
}

/// Settings for a console process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleSettings {
    pub listen_host: String,
    pub listen_port: u16,
    pub distribution_directory: PathBuf,
    pub distribution_filter: String,
    pub update_interval: Duration,
    pub flush_interval: Duration,
}

impl ConsoleSettings {
    /// Merges CLI arguments over the config file over defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when a configured interval is invalid.
    pub fn resolve(args: &ConsoleArgs, config: Option<&ConfigFile>) -> AppResult<Self> {
        let empty = ConsoleConfig::default();
        let file = config
            .and_then(|config| config.console.as_ref())
            .unwrap_or(&empty);
        Ok(Self {
            listen_host: args
                .listen_host
                .clone()
                .or_else(|| file.listen_host.clone())
                .unwrap_or_else(|| DEFAULT_LISTEN_HOST.to_owned()),
            listen_port: args
                .listen_port
                .or(file.listen_port)
                .unwrap_or(DEFAULT_CONSOLE_PORT),
            distribution_directory: args
                .distribution_directory
                .clone()
                .or_else(|| file.distribution_directory.clone())
                .unwrap_or_else(|| PathBuf::from(".")),
            distribution_filter: args
                .distribution_filter
                .clone()
                .or_else(|| file.distribution_filter.clone())
                .unwrap_or_else(|| DEFAULT_DISTRIBUTION_FILTER.to_owned()),
            update_interval: duration_field(
                "console.update_interval",
                args.update_interval_ms
                    .map(|ms| Duration::from_millis(ms.get())),
                file.update_interval.as_ref(),
                DEFAULT_UPDATE_INTERVAL,
            )?,
            flush_interval: duration_field(
                "console.flush_interval",
                args.flush_interval_ms
                    .map(|ms| Duration::from_millis(ms.get())),
                file.flush_interval.as_ref(),
                DEFAULT_FLUSH_INTERVAL,
            )?,
        })
    }

    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}

fn duration_field(
    field: &'static str,
    cli: Option<Duration>,
    file: Option<&DurationValue>,
    default: Duration,
) -> AppResult<Duration> {
    if let Some(duration) = cli {
        return Ok(duration);
    }
    match file {
        Some(value) => value
            .to_duration()
            .map_err(|err| AppError::config(ConfigError::InvalidDuration { field, source: err })),
        None => Ok(default),
    }
}

fn positive_field(field: &'static str, value: Option<usize>) -> AppResult<Option<usize>> {
    match value {
        Some(0) => Err(AppError::config(ConfigError::FieldMustBePositive {
            field,
            source: ValidationError::ValueTooSmall { min: 1 },
        })),
        Some(value) => Ok(Some(value)),
        None => Ok(None),
    }
}
