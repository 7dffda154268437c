//! Core library for the `loadfleet` CLI.
//!
//! A console accepts connections from agents, distributes a directory of
//! files to them, and tells them when to start and stop. Each agent runs a
//! population of worker processes against a script, ramping it up in steps,
//! and reports its own and its workers' state back to the console. The
//! primary user-facing interface is the `loadfleet` command-line
//! application; library APIs may evolve as the CLI grows.
pub mod agent;
pub mod args;
pub mod communication;
pub mod config;
pub mod console;
pub mod entry;
pub mod error;
pub mod identity;
pub mod logger;
pub mod shutdown;
pub mod worker;

#[cfg(test)]
mod test_support;
