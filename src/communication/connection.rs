use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::CommunicationError;

/// Class of a connection, announced by its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    Agent,
    Worker,
}

impl ConnectionType {
    const AGENT_BYTE: u8 = 0x01;
    const WORKER_BYTE: u8 = 0x02;

    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            ConnectionType::Agent => Self::AGENT_BYTE,
            ConnectionType::Worker => Self::WORKER_BYTE,
        }
    }

    /// Decodes a handshake byte.
    ///
    /// # Errors
    ///
    /// Returns an error for bytes that name no connection class.
    pub const fn from_byte(value: u8) -> Result<Self, CommunicationError> {
        match value {
            Self::AGENT_BYTE => Ok(ConnectionType::Agent),
            Self::WORKER_BYTE => Ok(ConnectionType::Worker),
            _ => Err(CommunicationError::UnknownConnectionType { value }),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Agent => "agent",
            ConnectionType::Worker => "worker",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoints of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionDetails {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub secure: bool,
}

impl ConnectionDetails {
    fn from_stream(stream: &TcpStream, context: &'static str) -> Result<Self, CommunicationError> {
        let local = stream
            .local_addr()
            .map_err(|err| CommunicationError::Io {
                context,
                source: err,
            })?;
        let remote = stream
            .peer_addr()
            .map_err(|err| CommunicationError::Io {
                context,
                source: err,
            })?;
        Ok(Self {
            local,
            remote,
            secure: false,
        })
    }

    pub(super) fn accepted(stream: &TcpStream) -> Result<Self, CommunicationError> {
        Self::from_stream(stream, "read accepted connection address")
    }
}

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Connection-scoped identity correlating a socket with its senders and
/// receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionIdentity(u64);

impl ConnectionIdentity {
    pub(super) fn allocate() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection-{}", self.0)
    }
}

/// Address and class of an outbound connection. Two connectors are equal when
/// they would open the same kind of connection to the same place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connector {
    host: String,
    port: u16,
    connection_type: ConnectionType,
}

impl Connector {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, connection_type: ConnectionType) -> Self {
        Self {
            host: host.into(),
            port,
            connection_type,
        }
    }

    /// Parses a `host:port` address.
    #[must_use]
    pub fn from_address(address: &str, connection_type: ConnectionType) -> Option<Self> {
        let (host, port) = address.rsplit_once(':')?;
        let port = port.parse().ok()?;
        Some(Self::new(host, port, connection_type))
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub const fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    /// Opens the connection and announces its class.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection cannot be established or the
    /// handshake byte cannot be written.
    pub async fn connect(&self) -> Result<(TcpStream, ConnectionDetails), CommunicationError> {
        let address = self.address();
        let mut stream =
            TcpStream::connect(&address)
                .await
                .map_err(|err| CommunicationError::Connection {
                    addr: address.clone(),
                    source: err,
                })?;
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY on {}: {}", address, err);
        }
        stream
            .write_all(&[self.connection_type.as_byte()])
            .await
            .map_err(|err| CommunicationError::Io {
                context: "send connection handshake",
                source: err,
            })?;
        let details = ConnectionDetails::from_stream(&stream, "read connection address")?;
        Ok((stream, details))
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.connection_type, self.host, self.port)
    }
}
