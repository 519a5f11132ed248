//! The `graphql-transport-ws` message envelope and its JSON codec.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::MessageType;
use crate::types::{ExecutionResult, GraphQlError, GraphQlRequest, deserialize_present};

/// Errors produced while decoding a text frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Not JSON, no `type` field, or a payload of the wrong shape.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One wire message, tagged by its `type` field.
///
/// Free-form payloads keep an explicit `null` distinct from an absent
/// payload so that decoding an encoded message yields the same value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    ConnectionInit {
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "deserialize_present"
        )]
        payload: Option<Value>,
    },
    ConnectionAck {
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "deserialize_present"
        )]
        payload: Option<Value>,
    },
    Ping {
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "deserialize_present"
        )]
        payload: Option<Value>,
    },
    Pong {
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "deserialize_present"
        )]
        payload: Option<Value>,
    },
    /// The id is optional on the wire so that a missing id reaches the
    /// protocol handler as an invalid message rather than a decode failure.
    Subscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        payload: GraphQlRequest,
    },
    Next {
        id: String,
        payload: ExecutionResult,
    },
    Error {
        id: String,
        payload: Vec<GraphQlError>,
    },
    Complete {
        id: String,
    },
    /// Any `type` this protocol version does not define.
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Decodes a text frame.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encodes this message as a JSON text frame.
    ///
    /// Every field serializes to JSON with string keys, so this only fails
    /// if a caller-supplied `Value` does.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Returns the type tag of this message.
    pub const fn kind(&self) -> MessageType {
        match self {
            Self::ConnectionInit { .. } => MessageType::ConnectionInit,
            Self::ConnectionAck { .. } => MessageType::ConnectionAck,
            Self::Ping { .. } => MessageType::Ping,
            Self::Pong { .. } => MessageType::Pong,
            Self::Subscribe { .. } => MessageType::Subscribe,
            Self::Next { .. } => MessageType::Next,
            Self::Error { .. } => MessageType::Error,
            Self::Complete { .. } => MessageType::Complete,
            Self::Unknown => MessageType::Unknown,
        }
    }

    /// Returns the operation id, if this kind carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Subscribe { id, .. } => id.as_deref(),
            Self::Next { id, .. } | Self::Error { id, .. } | Self::Complete { id } => Some(id),
            _ => None,
        }
    }

    /// Creates a `connection_ack`.
    pub fn ack(payload: Option<Value>) -> Self {
        Self::ConnectionAck { payload }
    }

    /// Creates a `pong`, typically echoing a `ping` payload.
    pub fn pong(payload: Option<Value>) -> Self {
        Self::Pong { payload }
    }

    /// Creates a `next` carrying one execution result.
    pub fn next(id: impl Into<String>, result: ExecutionResult) -> Self {
        Self::Next {
            id: id.into(),
            payload: result,
        }
    }

    /// Creates an `error` terminating an operation.
    pub fn error(id: impl Into<String>, errors: Vec<GraphQlError>) -> Self {
        Self::Error {
            id: id.into(),
            payload: errors,
        }
    }

    /// Creates a `complete` terminating an operation.
    pub fn complete(id: impl Into<String>) -> Self {
        Self::Complete { id: id.into() }
    }
}
