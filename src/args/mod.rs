//! CLI argument types and parsing helpers.
mod cli;
pub(crate) mod parsers;
mod types;


pub use cli::{AgentArgs, Command, ConsoleArgs, LoadfleetArgs};
pub use types::{PositiveU64, PositiveUsize};
