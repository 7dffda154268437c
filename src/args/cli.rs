use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use super::parsers::{parse_duration_arg, parse_positive_u64, parse_positive_usize};
use super::types::{PositiveU64, PositiveUsize};

#[derive(Debug, Parser, Clone)]
#[clap(
    version,
    about = "Distributed load generation: a console directing agents that supervise worker processes."
)]
pub struct LoadfleetArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Path to config file (TOML/JSON). Defaults to ./loadfleet.toml or ./loadfleet.json
    #[arg(long, global = true, env = "LOADFLEET_CONFIG")]
    pub config: Option<String>,

    /// Enable verbose logging (sets log level to debug unless overridden by LOADFLEET_LOG/RUST_LOG)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Disable colored log output
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run an agent that launches workers on instruction from a console
    Agent(AgentArgs),
    /// Run a console that directs agents and aggregates their status
    Console(ConsoleArgs),
    /// Run a single worker; launched by an agent, reads its setup from stdin
    #[command(hide = true)]
    Worker,
}

#[derive(Debug, Args, Clone, Default)]
pub struct AgentArgs {
    /// Console host to connect to
    #[arg(long = "console-host", env = "LOADFLEET_CONSOLE_HOST")]
    pub console_host: Option<String>,

    /// Console port to connect to
    #[arg(long = "console-port", env = "LOADFLEET_CONSOLE_PORT")]
    pub console_port: Option<u16>,

    /// Run without a console: start workers for the local script, then exit
    #[arg(long = "no-console")]
    pub no_console: bool,

    /// Agent name reported to the console (defaults to the host name)
    #[arg(long = "host-id")]
    pub host_id: Option<String>,

    /// Script to run when the console does not name one
    #[arg(long)]
    pub script: Option<PathBuf>,

    /// Number of worker processes per run
    #[arg(long, short = 'p', value_parser = parse_positive_usize)]
    pub processes: Option<PositiveUsize>,

    /// Workers started at once when ramping up (defaults to the increment)
    #[arg(long = "initial-processes", value_parser = parse_positive_usize)]
    pub initial_processes: Option<PositiveUsize>,

    /// Workers added per ramp-up step (0 starts every worker at once)
    #[arg(long = "process-increment")]
    pub process_increment: Option<usize>,

    /// Time between ramp-up steps (supports ms/s/m/h)
    #[arg(long = "process-increment-interval", value_parser = parse_duration_arg)]
    pub process_increment_interval: Option<Duration>,

    /// Time workers get to exit after a stop before they are killed (supports ms/s/m/h)
    #[arg(long = "shutdown-grace", value_parser = parse_duration_arg)]
    pub shutdown_grace: Option<Duration>,

    /// Run workers as tasks inside the agent process (debugging aid)
    #[arg(long = "single-process")]
    pub single_process: bool,

    /// Program launched for each worker (defaults to this executable)
    #[arg(long = "worker-command")]
    pub worker_command: Option<PathBuf>,

    /// Extra argument passed to each worker process (repeatable)
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    pub worker_arguments: Vec<String>,

    /// File store directory (defaults to ./<host-id>-file-store)
    #[arg(long = "file-store")]
    pub file_store_directory: Option<PathBuf>,

    /// Keep reconnecting after the console goes away
    #[arg(long)]
    pub standby: bool,

    /// Delay before reconnecting in standby mode (supports ms/s/m/h)
    #[arg(long = "reconnect-delay", value_parser = parse_duration_arg)]
    pub reconnect_delay: Option<Duration>,
}

#[derive(Debug, Args, Clone, Default)]
pub struct ConsoleArgs {
    /// Address to listen on for agents and workers
    #[arg(long = "listen-host")]
    pub listen_host: Option<String>,

    /// Port to listen on for agents and workers
    #[arg(long = "listen-port", env = "LOADFLEET_CONSOLE_PORT")]
    pub listen_port: Option<u16>,

    /// Directory whose files are distributed to agents
    #[arg(long = "distribution-directory")]
    pub distribution_directory: Option<PathBuf>,

    /// Regular expression of file names never distributed (directories end in '/')
    #[arg(long = "distribution-filter")]
    pub distribution_filter: Option<String>,

    /// Interval between status updates (ms)
    #[arg(long = "update-interval-ms", value_parser = parse_positive_u64)]
    pub update_interval_ms: Option<PositiveU64>,

    /// Interval after which silent agents are dropped from status (ms)
    #[arg(long = "flush-interval-ms", value_parser = parse_positive_u64)]
    pub flush_interval_ms: Option<PositiveU64>,
}
