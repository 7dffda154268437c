//! Framed message transport, dispatch, and broadcast.
mod acceptor;
pub mod codec;
mod connection;
mod dispatch;
mod fan_out;
pub mod message;
mod pump;
mod receiver;
mod sender;

pub use acceptor::{Acceptor, AddressedMessage, ConnectionEvent};
pub use connection::{ConnectionDetails, ConnectionIdentity, ConnectionType, Connector};
pub use dispatch::{HandlerChain, HandlerOutcome, MessageDispatch, MessageHandler, SenderHandler};
pub use fan_out::FanOutSender;
pub use message::{
    AgentProcessReport, CacheHighWaterMark, FileContents, InitialiseWorker, Message, MessageKind,
    ProcessState, StartMessage, WorkerProcessReport,
};
pub use pump::MessagePump;
pub use receiver::{Receiver, StreamReceiver};
pub use sender::{Sender, StreamSender, TeeSender};
