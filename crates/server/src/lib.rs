//! GraphQL over WebSocket session server.
//!
//! Implements the server side of the `graphql-transport-ws` sub-protocol:
//! connection-init gating with timeout, per-operation subscription
//! tracking, concurrent multiplexing of many operations over one socket
//! through a single serialized writer, and the protocol close codes.
//!
//! The protocol logic lives in [`Connection`] and is transport-agnostic.
//! Two thin adapters drive it: [`GraphQlWsServer`] (tokio tasks) and
//! [`BlockingServer`] (one OS thread per socket).

mod blocking;
mod connection;
mod gateway;
mod handler;
mod handshake;
mod lifecycle;
mod server;
mod session;
mod violation;

pub use blocking::BlockingServer;
pub use connection::{Connection, ConnectionInfo, Outbound, SendError, Sender};
pub use gateway::{Execution, ExecutionGateway, GatewayError, GatewayFuture, ResponseStream};
pub use handler::{DefaultHandler, Handler, HandlerFuture, InitFuture, InitRejected};
pub use lifecycle::{Negotiation, negotiate_subprotocol};
pub use server::{GraphQlWsServer, ServerConfig};
pub use session::{Phase, SessionState};
pub use violation::ProtocolViolation;

/// Outbound queue capacity per connection.
///
/// Producers wait when the queue is full, so a slow client applies
/// backpressure to its own operations only.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the transport adapters.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
