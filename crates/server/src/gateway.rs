//! Boundary to the GraphQL execution engine.
//!
//! The engine is opaque: it receives a request and hands back either one
//! result or a lazy stream of results. Whether an operation streams is
//! decided by the shape of what comes back, never by inspecting the
//! document.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;
use futures_util::stream::BoxStream;
use graphwire_protocol::{ExecutionResult, GraphQlError, GraphQlRequest};

use crate::connection::ConnectionInfo;

/// Results of a streaming operation. An `Err` item ends the operation with
/// an `error` message.
pub type ResponseStream = BoxStream<'static, Result<ExecutionResult, Vec<GraphQlError>>>;

/// A boxed future returned by [`ExecutionGateway::execute`].
pub type GatewayFuture<'a> = Pin<Box<dyn Future<Output = Result<Execution, GatewayError>> + Send + 'a>>;

/// What the engine produced for one request.
pub enum Execution {
    /// A query or mutation: exactly one result.
    Single(ExecutionResult),
    /// A subscription: results until the stream ends, errors, or is dropped.
    Stream(ResponseStream),
}

impl Execution {
    /// Wraps any sendable stream of results.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<ExecutionResult, Vec<GraphQlError>>> + Send + 'static,
    {
        Self::Stream(Box::pin(stream))
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(result) => f.debug_tuple("Single").field(result).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// The engine refused the request before producing any result
/// (parse or validation failure, unknown operation).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("request rejected with {} error(s)", errors.len())]
pub struct GatewayError {
    pub errors: Vec<GraphQlError>,
}

impl GatewayError {
    pub fn new(errors: Vec<GraphQlError>) -> Self {
        Self { errors }
    }

    /// A rejection carrying a single error message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::new(vec![GraphQlError::new(message)])
    }
}

/// Executes GraphQL requests on behalf of a connection.
///
/// Dropping the returned future or stream cancels the work; the session
/// relies on that for `complete`, duplicate ids and connection close.
pub trait ExecutionGateway: Send + Sync + 'static {
    fn execute(&self, info: Arc<ConnectionInfo>, request: GraphQlRequest) -> GatewayFuture<'_>;
}

impl<G: ExecutionGateway> ExecutionGateway for Arc<G> {
    fn execute(&self, info: Arc<ConnectionInfo>, request: GraphQlRequest) -> GatewayFuture<'_> {
        (**self).execute(info, request)
    }
}
