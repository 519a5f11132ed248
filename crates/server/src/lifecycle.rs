//! Connection lifecycle: sub-protocol negotiation, the init deadline,
//! keep-alive pings, and the close paths.

use std::sync::Arc;
use std::time::Duration;

use graphwire_protocol::Message;
use graphwire_protocol::constants::{GRAPHQL_TRANSPORT_WS_PROTOCOL, LEGACY_GRAPHQL_WS_PROTOCOL};

use crate::connection::{ConnectionInfo, Sender};
use crate::handler::Handler;
use crate::session::SessionState;
use crate::violation::ProtocolViolation;

/// Outcome of sub-protocol negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Negotiation {
    /// Proceed; echo the protocol if one was selected.
    #[default]
    Accepted,
    /// `graphql-transport-ws` was offered and selected.
    Selected(&'static str),
    /// Only the legacy `graphql-ws` protocol was offered. It is echoed so
    /// the handshake completes, then the connection is closed with 4400.
    Legacy(&'static str),
}

impl Negotiation {
    /// Protocol to echo in `Sec-WebSocket-Protocol`, if any.
    pub const fn response_protocol(self) -> Option<&'static str> {
        match self {
            Self::Accepted => None,
            Self::Selected(p) | Self::Legacy(p) => Some(p),
        }
    }
}

/// Picks a sub-protocol from the comma-separated values the client offered.
///
/// A client that offers nothing (or only unknown names) is accepted and
/// spoken to in `graphql-transport-ws`.
pub fn negotiate_subprotocol<'a>(offered: impl IntoIterator<Item = &'a str>) -> Negotiation {
    let mut legacy = false;
    for name in offered.into_iter().flat_map(|v| v.split(',')).map(str::trim) {
        if name.eq_ignore_ascii_case(GRAPHQL_TRANSPORT_WS_PROTOCOL) {
            return Negotiation::Selected(GRAPHQL_TRANSPORT_WS_PROTOCOL);
        }
        if name.eq_ignore_ascii_case(LEGACY_GRAPHQL_WS_PROTOCOL) {
            legacy = true;
        }
    }
    if legacy {
        Negotiation::Legacy(LEGACY_GRAPHQL_WS_PROTOCOL)
    } else {
        Negotiation::Accepted
    }
}

/// Owns the close paths of one connection and its timers.
pub(crate) struct Supervisor<H> {
    info: Arc<ConnectionInfo>,
    state: Arc<SessionState>,
    sender: Sender,
    handler: Arc<H>,
}

impl<H: Handler> Supervisor<H> {
    pub(crate) fn new(
        info: Arc<ConnectionInfo>,
        state: Arc<SessionState>,
        sender: Sender,
        handler: Arc<H>,
    ) -> Self {
        Self {
            info,
            state,
            sender,
            handler,
        }
    }

    /// Starts the one-shot init timer and, if set, the keep-alive pinger.
    /// Both stop as soon as the connection starts closing.
    pub(crate) fn start(self: &Arc<Self>, init_timeout: Duration, keep_alive: Option<Duration>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.init_deadline(init_timeout).await;
        });

        if let Some(period) = keep_alive {
            tokio::spawn(keep_alive_pump(self.sender.clone(), period));
        }
    }

    async fn init_deadline(&self, timeout: Duration) {
        tokio::select! {
            () = self.sender.closed().cancelled() => {}
            () = tokio::time::sleep(timeout) => {
                if !self.state.init_received() {
                    tracing::info!(
                        connection_id = %self.info.id,
                        "no connection_init within {timeout:?}"
                    );
                    self.close(&ProtocolViolation::InitTimeout).await;
                }
            }
        }
    }

    /// Server-initiated close for a protocol violation.
    pub(crate) async fn close(&self, violation: &ProtocolViolation) {
        let code = violation.close_code().code();
        self.close_with(code, &violation.to_string()).await;
    }

    /// Server-initiated close. Idempotent: only the first call queues a
    /// close frame.
    pub(crate) async fn close_with(&self, code: u16, reason: &str) {
        if !self.state.begin_closing() {
            return;
        }
        self.state.record_close_code(code);
        let cancelled = self.state.cancel_all();
        tracing::info!(
            connection_id = %self.info.id,
            code,
            reason,
            cancelled,
            "closing connection"
        );
        self.sender.send_close(code, reason).await;
    }

    /// The socket is gone. Runs once: cancels every live operation and
    /// notifies the handler with the effective close code.
    pub(crate) async fn connection_closed(&self, peer_code: u16) {
        if !self.state.mark_closed() {
            return;
        }
        self.sender.shut();
        let cancelled = self.state.cancel_all();
        let code = self.state.close_code().unwrap_or(peer_code);
        tracing::info!(
            connection_id = %self.info.id,
            code,
            cancelled,
            "connection closed"
        );
        self.handler
            .on_connection_closed(&self.info, code, self.state.init_payload())
            .await;
    }
}

/// Queues a protocol `ping` every `period` until the connection closes.
async fn keep_alive_pump(sender: Sender, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            () = sender.closed().cancelled() => break,
            _ = interval.tick() => {
                if sender.send_msg(&Message::Ping { payload: None }).await.is_err() {
                    break;
                }
            }
        }
    }
}
