//! Configuration loading and resolution.
mod settings;
pub mod types;


use std::path::Path;

use crate::error::AppResult;

pub use settings::{
    AgentSettings, ConsoleSettings, DEFAULT_CONSOLE_PORT, DEFAULT_DISTRIBUTION_FILTER,
    WorkerSettings,
};
pub use types::{ConfigFile, ConfigFormat};

/// Looked for in the working directory when no path is given.
const DEFAULT_CONFIG_FILES: [&str; 2] = ["loadfleet.toml", "loadfleet.json"];

/// Reads the config file at `path`, or the first default file present.
///
/// # Errors
///
/// Returns an error when the chosen file cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> AppResult<Option<ConfigFile>> {
    let chosen = match path {
        Some(path) => Some(Path::new(path)),
        None => DEFAULT_CONFIG_FILES
            .iter()
            .map(Path::new)
            .find(|candidate| candidate.exists()),
    };
    match chosen {
        Some(chosen) => Ok(Some(ConfigFile::read(chosen)?)),
        None => Ok(None),
    }
}
