use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::args::parsers::parse_duration;
use crate::error::{ConfigError, ValidationError};

/// Config file syntax, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// # Errors
    ///
    /// Returns an error unless `path` ends in `.toml` or `.json`.
    pub fn of(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            Some(ext) => Err(ConfigError::UnsupportedExtension {
                ext: ext.to_owned(),
            }),
            None => Err(ConfigError::MissingExtension),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub agent: Option<AgentConfig>,
    pub console: Option<ConsoleConfig>,
    pub worker: Option<WorkerConfig>,
}

impl ConfigFile {
    /// Reads and parses the file at `path` in the format its extension names.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read, has an unknown
    /// extension, or does not parse.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let format = ConfigFormat::of(path)?;
        let content = std::fs::read_to_string(path).map_err(|err| ConfigError::ReadConfig {
            path: path.to_path_buf(),
            source: err,
        })?;
        match format {
            ConfigFormat::Toml => toml::from_str(&content).map_err(|err| ConfigError::ParseToml {
                path: path.to_path_buf(),
                source: err,
            }),
            ConfigFormat::Json => {
                serde_json::from_str(&content).map_err(|err| ConfigError::ParseJson {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AgentConfig {
    pub use_console: Option<bool>,
    pub console_host: Option<String>,
    pub console_port: Option<u16>,
    pub host_id: Option<String>,
    pub script: Option<PathBuf>,
    pub processes: Option<usize>,
    pub initial_processes: Option<usize>,
    pub process_increment: Option<usize>,
    pub process_increment_interval: Option<DurationValue>,
    pub shutdown_grace: Option<DurationValue>,
    pub single_process: Option<bool>,
    pub worker_command: Option<PathBuf>,
    pub worker_arguments: Option<Vec<String>>,
    pub file_store_directory: Option<PathBuf>,
    pub standby: Option<bool>,
    pub reconnect_delay: Option<DurationValue>,
    pub report_interval: Option<DurationValue>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConsoleConfig {
    pub listen_host: Option<String>,
    pub listen_port: Option<u16>,
    pub distribution_directory: Option<PathBuf>,
    pub distribution_filter: Option<String>,
    pub update_interval: Option<DurationValue>,
    pub flush_interval: Option<DurationValue>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WorkerConfig {
    pub interpreter: Option<String>,
    pub report_interval: Option<DurationValue>,
}

/// A duration given either as integer milliseconds or as text with a unit.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Milliseconds(u64),
    Text(String),
}

impl DurationValue {
    pub(crate) fn to_duration(&self) -> Result<Duration, ValidationError> {
        match self {
            DurationValue::Milliseconds(ms) => {
                if *ms == 0 {
                    Err(ValidationError::DurationZero)
                } else {
                    Ok(Duration::from_millis(*ms))
                }
            }
            DurationValue::Text(text) => parse_duration(text),
        }
    }
}
