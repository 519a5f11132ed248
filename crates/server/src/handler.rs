//! Hook trait for connection lifecycle events.
//!
//! Implementors provide authorization and bookkeeping while the session
//! handles the protocol. Every method has a default so handlers only
//! override what they need.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::connection::ConnectionInfo;

/// A boxed future returned by handler notifications.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A boxed future returned by [`Handler::on_connection_init`].
pub type InitFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Value>, InitRejected>> + Send + 'a>>;

/// Returned by the init hook to refuse a connection (closed with 4401).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("connection init rejected: {reason}")]
pub struct InitRejected {
    pub reason: String,
}

impl InitRejected {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Trait for reacting to connection lifecycle events.
pub trait Handler: Send + Sync + 'static {
    /// Called for the first `connection_init`.
    ///
    /// `Ok(payload)` acknowledges the connection; the payload, if any, is
    /// sent back in `connection_ack`. `Err` closes with 4401.
    fn on_connection_init<'a>(
        &'a self,
        info: &'a ConnectionInfo,
        payload: Option<Value>,
    ) -> InitFuture<'a> {
        let _ = (info, payload);
        Box::pin(async { Ok(None) })
    }

    /// Called once when the client completes an operation that was live.
    fn on_subscription_cancelled<'a>(
        &'a self,
        info: &'a ConnectionInfo,
        id: &'a str,
    ) -> HandlerFuture<'a> {
        let _ = (info, id);
        Box::pin(async {})
    }

    /// Called exactly once when the socket is gone, whoever closed it.
    fn on_connection_closed<'a>(
        &'a self,
        info: &'a ConnectionInfo,
        code: u16,
        init_payload: Option<Value>,
    ) -> HandlerFuture<'a> {
        let _ = (info, code, init_payload);
        Box::pin(async {})
    }
}

/// Accepts every connection and ignores lifecycle events.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl Handler for DefaultHandler {}
