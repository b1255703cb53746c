//! Connection bootstrap for the Crossworld realtime pub/sub client.
//!
//! This crate provides:
//! - Transport traits and an event dispatcher shared by implementations
//! - Priority-aware transport strategies with abortable attempts
//! - The protocol handshake and the close-code policy
//! - Live connections over an accepted transport
//! - HTTP streaming/polling sockets and an in-process memory transport

pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod location;
pub mod memory;
pub mod protocol;
pub mod socket;
pub mod socket_transport;
pub mod strategy;
pub mod transport;

pub use config::{StrategyOptions, PROTOCOL_VERSION};
pub use connection::{Connection, ConnectionEvent};
pub use error::{NetworkError, NetworkResult};
pub use handshake::{Handshake, HandshakeOutcome, HandshakeResult};
pub use memory::{MemoryTransport, MemoryTransportFactory};
pub use protocol::{HandshakeAction, ProtocolMessage};
pub use socket::{
    HttpClient, PollingHooks, SocketHooks, SocketState, StreamRequest, StreamSink, StreamSocket,
    StreamingHooks,
};
pub use socket_transport::{HttpTransportFactory, SocketTransport};
pub use strategy::{AttemptHandle, PendingAttempt, Strategy, TransportStrategy};
pub use transport::{CloseEvent, MessageEvent, Transport, TransportEvent, TransportFactory};
