use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CommunicationError;

use super::connection::{ConnectionDetails, ConnectionIdentity, ConnectionType};
use super::fan_out::FanOutSender;
use super::message::Message;
use super::receiver::{Receiver, StreamReceiver};
use super::sender::{Sender, StreamSender};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A message tagged with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct AddressedMessage {
    pub connection: ConnectionIdentity,
    pub message: Message,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Accepted {
        identity: ConnectionIdentity,
        connection_type: ConnectionType,
        details: ConnectionDetails,
    },
    Closed {
        identity: ConnectionIdentity,
        connection_type: ConnectionType,
    },
}

type ConnectionTable = Arc<Mutex<HashMap<ConnectionIdentity, ConnectionType>>>;

#[derive(Clone)]
struct AcceptorShared {
    connections: ConnectionTable,
    agents: Arc<FanOutSender>,
    events: broadcast::Sender<ConnectionEvent>,
    inbound: mpsc::UnboundedSender<AddressedMessage>,
    stop: CancellationToken,
}

/// Listens for agent and worker connections.
///
/// Every received message is forwarded, tagged with its connection, to the
/// inbound queue given at bind time. The write halves of agent connections
/// form the fan-out returned by [`Acceptor::agent_sender`].
pub struct Acceptor {
    local_addr: SocketAddr,
    shared: AcceptorShared,
    accept_task: JoinHandle<()>,
}

impl Acceptor {
    /// Binds the listener and starts accepting.
    ///
    /// # Errors
    ///
    /// Returns an error when the address cannot be bound.
    pub async fn bind(
        address: &str,
        inbound: mpsc::UnboundedSender<AddressedMessage>,
    ) -> Result<Self, CommunicationError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|err| CommunicationError::Bind {
                addr: address.to_owned(),
                source: err,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| CommunicationError::Io {
                context: "read listener address",
                source: err,
            })?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = AcceptorShared {
            connections: Arc::new(Mutex::new(HashMap::new())),
            agents: Arc::new(FanOutSender::new()),
            events,
            inbound,
            stop: CancellationToken::new(),
        };
        info!("Listening for agents and workers on {}", local_addr);
        let accept_task = tokio::spawn(accept_loop(listener, shared.clone()));
        Ok(Self {
            local_addr,
            shared,
            accept_task,
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Fan-out over every live agent connection.
    #[must_use]
    pub fn agent_sender(&self) -> Arc<FanOutSender> {
        Arc::clone(&self.shared.agents)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    #[must_use]
    pub fn number_of_connections(&self, connection_type: ConnectionType) -> usize {
        lock_connections(&self.shared.connections)
            .values()
            .filter(|kind| **kind == connection_type)
            .count()
    }

    /// Closes the listener and every accepted connection.
    pub async fn shutdown(self) {
        self.shared.stop.cancel();
        if let Err(err) = self.accept_task.await {
            eprintln!("Acceptor task failed: {}", err);
        }
        self.shared.agents.shutdown().await;
    }
}

async fn accept_loop(listener: TcpListener, shared: AcceptorShared) {
    loop {
        let accepted = tokio::select! {
            () = shared.stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                debug!("Accepted connection from {}", addr);
                tokio::spawn(serve_connection(stream, addr, shared.clone()));
            }
            Err(err) => {
                warn!("Accept failed: {}", err);
            }
        }
    }
    debug!("Acceptor stopped");
}

async fn serve_connection(mut stream: TcpStream, addr: SocketAddr, shared: AcceptorShared) {
    let connection_type = match read_handshake(&mut stream, addr).await {
        Ok(connection_type) => connection_type,
        Err(err) => {
            warn!("Rejected connection from {}: {}", addr, err);
            return;
        }
    };
    let details = match ConnectionDetails::accepted(&stream) {
        Ok(details) => details,
        Err(err) => {
            warn!("Rejected connection from {}: {}", addr, err);
            return;
        }
    };
    if let Err(err) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", addr, err);
    }

    let identity = ConnectionIdentity::allocate();
    let (read_half, write_half) = stream.into_split();
    match connection_type {
        ConnectionType::Agent => {
            let sender: Arc<dyn Sender> = Arc::new(StreamSender::new(write_half));
            shared.agents.add(identity.value(), sender).await;
        }
        ConnectionType::Worker => drop(write_half),
    }
    lock_connections(&shared.connections).insert(identity, connection_type);
    info!("{} connection {} from {}", connection_type, identity, details.remote);
    publish(
        &shared.events,
        ConnectionEvent::Accepted {
            identity,
            connection_type,
            details,
        },
    );

    let mut receiver = StreamReceiver::new(read_half);
    loop {
        let received = tokio::select! {
            () = shared.stop.cancelled() => break,
            received = receiver.receive() => received,
        };
        match received {
            Ok(Some(message)) => {
                let addressed = AddressedMessage {
                    connection: identity,
                    message,
                };
                if shared.inbound.send(addressed).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!("Receive on {} failed: {}", identity, err);
                break;
            }
        }
    }
    receiver.shutdown();

    if connection_type == ConnectionType::Agent {
        shared.agents.remove(identity.value()).await;
    }
    lock_connections(&shared.connections).remove(&identity);
    info!("{} connection {} closed", connection_type, identity);
    publish(
        &shared.events,
        ConnectionEvent::Closed {
            identity,
            connection_type,
        },
    );
}

fn publish(events: &broadcast::Sender<ConnectionEvent>, event: ConnectionEvent) {
    if let Err(broadcast::error::SendError(event)) = events.send(event) {
        debug!("No subscribers for {:?}", event);
    }
}

fn lock_connections(
    connections: &Mutex<HashMap<ConnectionIdentity, ConnectionType>>,
) -> MutexGuard<'_, HashMap<ConnectionIdentity, ConnectionType>> {
    match connections.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn read_handshake(
    stream: &mut TcpStream,
    addr: SocketAddr,
) -> Result<ConnectionType, CommunicationError> {
    let byte = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_u8())
        .await
        .map_err(|_elapsed| CommunicationError::HandshakeTimeout {
            addr: addr.to_string(),
        })?
        .map_err(|err| CommunicationError::Io {
            context: "read connection handshake",
            source: err,
        })?;
    ConnectionType::from_byte(byte)
}
