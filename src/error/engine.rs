use std::path::PathBuf;

use thiserror::Error;

use super::CommunicationError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to start worker process '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Worker process '{command}' has no communication stream.")]
    MissingWorkerStream { command: String },
    #[error("Failed to initialise worker {worker}: {source}")]
    InitialiseWorker {
        worker: String,
        #[source]
        source: CommunicationError,
    },
    #[error("Failed to wait for worker {worker}: {source}")]
    WaitForWorker {
        worker: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Expected an initialisation message, got '{kind}'.")]
    UnexpectedInitialisation { kind: &'static str },
    #[error("Worker communication stream closed before initialisation.")]
    MissingInitialisation,
    #[error("Cannot run script '{path}': {source}")]
    ScriptNotReadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Script '{path}' is not a regular file.")]
    ScriptNotAFile { path: PathBuf },
    #[error("Script '{path}' is outside the file store '{store}'.")]
    ScriptOutsideFileStore { path: PathBuf, store: PathBuf },
    #[error("Failed to start script '{path}' with '{interpreter}': {source}")]
    ScriptSpawn {
        path: PathBuf,
        interpreter: String,
        #[source]
        source: std::io::Error,
    },
}
