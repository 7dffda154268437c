mod app;
mod communication;
mod config;
mod engine;
mod validation;

#[cfg(test)]
mod test_support;

pub use app::{AppError, AppResult};
pub use communication::CommunicationError;
pub use config::ConfigError;
pub use engine::EngineError;
pub use validation::ValidationError;
