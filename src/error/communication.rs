use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommunicationError {
    #[error("I/O error during {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection error to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Bind error on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection closed.")]
    ConnectionClosed,
    #[error("Connection closed part way through a frame.")]
    TruncatedFrame,
    #[error("Wire message exceeded max size ({max_bytes} bytes).")]
    WireMessageTooLarge { max_bytes: usize },
    #[error("Unknown connection type byte {value:#04x}.")]
    UnknownConnectionType { value: u8 },
    #[error("Timed out waiting for connection handshake from {addr}.")]
    HandshakeTimeout { addr: String },
    #[error("Serialization error during {context}: {source}")]
    Serialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Deserialization error during {context}: {source}")]
    Deserialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Sender has been shut down.")]
    Shutdown,
    #[error("Send did not complete within {timeout_ms}ms.")]
    SendTimeout { timeout_ms: u128 },
    #[error("Invalid file contents path '{path}'.")]
    InvalidFileContentsPath { path: PathBuf },
    #[error("Invalid file contents encoding for '{path}': {source}")]
    InvalidFileContentsEncoding {
        path: PathBuf,
        #[source]
        source: base64::DecodeError,
    },
    #[error("File store could not {action} '{path}': {source}")]
    FileStore {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not read distribution file '{path}': {source}")]
    DistributionFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
