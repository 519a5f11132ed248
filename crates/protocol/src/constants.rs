use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sub-protocol name negotiated through `Sec-WebSocket-Protocol`.
pub const GRAPHQL_TRANSPORT_WS_PROTOCOL: &str = "graphql-transport-ws";

/// Legacy sub-protocol (subscriptions-transport-ws). Always rejected.
pub const LEGACY_GRAPHQL_WS_PROTOCOL: &str = "graphql-ws";

/// Time a client has to send `connection_init` after the handshake.
pub const DEFAULT_CONNECTION_INIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Time allowed to flush queued frames once a connection is closing.
pub const WS_WRITE_WAIT: Duration = Duration::from_secs(30);

/// Maximum inbound message size in bytes (1 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Normal closure.
pub const WS_CLOSE_NORMAL: u16 = 1000;

/// Server going down or the connection being dropped on shutdown.
pub const WS_CLOSE_GOING_AWAY: u16 = 1001;

/// Peer sent a close frame without a status code.
pub const WS_CLOSE_NO_STATUS: u16 = 1005;

/// Connection dropped without a close frame (I/O error, reset).
pub const WS_CLOSE_ABNORMAL: u16 = 1006;

/// Wire message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Connection management
    #[serde(rename = "connection_init")]
    ConnectionInit,
    #[serde(rename = "connection_ack")]
    ConnectionAck,

    // Liveness, either direction
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,

    // Operations
    #[serde(rename = "subscribe")]
    Subscribe,
    #[serde(rename = "next")]
    Next,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "complete")]
    Complete,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Returns the wire name of this type.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionInit => "connection_init",
            Self::ConnectionAck => "connection_ack",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Subscribe => "subscribe",
            Self::Next => "next",
            Self::Error => "error",
            Self::Complete => "complete",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_serialization() {
        assert_eq!(
            serde_json::to_string(&MessageType::ConnectionInit).unwrap(),
            "\"connection_init\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::Subscribe).unwrap(),
            "\"subscribe\""
        );
    }

    #[test]
    fn message_type_deserialization() {
        let mt: MessageType = serde_json::from_str("\"connection_ack\"").unwrap();
        assert_eq!(mt, MessageType::ConnectionAck);
    }

    #[test]
    fn unknown_message_type() {
        let mt: MessageType = serde_json::from_str("\"start\"").unwrap();
        assert_eq!(mt, MessageType::Unknown);
    }

    #[test]
    fn display_matches_wire_name() {
        for mt in [
            MessageType::ConnectionInit,
            MessageType::ConnectionAck,
            MessageType::Ping,
            MessageType::Pong,
            MessageType::Subscribe,
            MessageType::Next,
            MessageType::Error,
            MessageType::Complete,
        ] {
            let json = serde_json::to_string(&mt).unwrap();
            assert_eq!(json, format!("\"{mt}\""));
        }
    }
}
