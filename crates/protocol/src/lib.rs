//! Wire protocol types for GraphQL over WebSocket.
//!
//! Implements the message envelope, codec and close codes of the
//! `graphql-transport-ws` sub-protocol, plus the GraphQL request, response
//! and error shapes those messages carry.

pub mod close;
pub mod constants;
pub mod envelope;
pub mod types;

// Re-export primary types for convenience.
pub use close::CloseCode;
pub use constants::MessageType;
pub use envelope::{DecodeError, Message};
pub use types::{ExecutionResult, GraphQlError, GraphQlRequest, JsonMap, Location, PathSegment};
