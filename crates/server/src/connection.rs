//! Connection plumbing shared by both transports: handshake metadata, the
//! serialized outbound queue, and the [`Connection`] unit the adapters drive.

use std::net::SocketAddr;
use std::sync::Arc;

use graphwire_protocol::Message;
use graphwire_protocol::constants::WS_CLOSE_GOING_AWAY;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::gateway::ExecutionGateway;
use crate::handler::Handler;
use crate::lifecycle::Supervisor;
use crate::server::ServerConfig;
use crate::session::{Session, SessionState};
use crate::violation::ProtocolViolation;

/// Longest close reason that fits a control frame (125 bytes minus the code).
const MAX_CLOSE_REASON: usize = 123;

/// Metadata captured when the WebSocket handshake was accepted.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: Uuid,
    /// Selected sub-protocol, `None` if the client offered none.
    pub subprotocol: Option<String>,
    pub remote_addr: Option<SocketAddr>,
    pub uri: String,
    pub headers: Vec<(String, String)>,
}

impl ConnectionInfo {
    /// Info for a connection that did not come through a handshake.
    pub fn local() -> Self {
        Self {
            id: Uuid::new_v4(),
            subprotocol: None,
            remote_addr: None,
            uri: "/".into(),
            headers: Vec::new(),
        }
    }

    /// Returns the first header value named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// An item for the connection's single writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// An encoded protocol message.
    Text(String),
    /// The close frame. The writer stops after sending it.
    Close { code: u16, reason: String },
}

/// Handle for queueing frames to the connection's writer.
///
/// Cloneable and cheap; every operation task holds one. All clones feed
/// the same FIFO queue, which is drained by exactly one writer.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

/// Error returned when the connection is closing or gone.
#[derive(Debug, thiserror::Error)]
#[error("send failed: connection closing or closed")]
pub struct SendError;

impl Sender {
    /// Encodes and queues a message, waiting while the queue is full.
    ///
    /// Gives up once the connection starts closing or the writer is gone.
    pub async fn send_msg(&self, msg: &Message) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError);
        }
        let json = msg.encode().map_err(|e| {
            tracing::error!("failed to encode {} message: {e}", msg.kind());
            SendError
        })?;
        tokio::select! {
            sent = self.tx.send(Outbound::Text(json)) => sent.map_err(|_| SendError),
            () = self.closed.cancelled() => Err(SendError),
        }
    }

    /// Returns `true` until the close frame was queued or the socket is gone.
    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    /// Token cancelled once the close frame was queued or the socket is gone.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Queues the close frame behind every frame already queued, then
    /// refuses further frames. Returns early if the writer goes away while
    /// the queue is full.
    pub(crate) async fn send_close(&self, code: u16, reason: &str) {
        let reason = truncate_reason(reason).to_owned();
        if self.tx.send(Outbound::Close { code, reason }).await.is_err() {
            tracing::debug!(code, "writer already gone, close frame dropped");
        }
        self.closed.cancel();
    }

    /// Refuses further frames without queueing a close frame.
    pub(crate) fn shut(&self) {
        self.closed.cancel();
    }
}

/// Creates a connection outbox with the given capacity.
pub(crate) fn outbox(capacity: usize) -> (Sender, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sender = Sender {
        tx,
        closed: CancellationToken::new(),
    };
    (sender, rx)
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

/// One accepted WebSocket connection: the protocol session plus its
/// lifecycle supervisor.
///
/// Transports feed inbound frames in, ship the [`Outbound`] items returned
/// by [`Connection::open`] to the socket, and report the socket's end via
/// [`Connection::finish`]. No protocol decision is made by a transport.
pub struct Connection<G, H> {
    session: Session<G, H>,
    supervisor: Arc<Supervisor<H>>,
}

impl<G: ExecutionGateway, H: Handler> Connection<G, H> {
    /// Creates the session for an accepted socket and starts its init
    /// timer (and keep-alive, if configured).
    ///
    /// Must be called from within a tokio runtime context.
    pub fn open(
        info: ConnectionInfo,
        gateway: Arc<G>,
        handler: Arc<H>,
        config: &ServerConfig,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let info = Arc::new(info);
        let state = Arc::new(SessionState::new());
        let (sender, rx) = outbox(config.send_buffer);

        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&info),
            Arc::clone(&state),
            sender.clone(),
            Arc::clone(&handler),
        ));
        supervisor.start(config.connection_init_timeout, config.keep_alive);

        let session = Session::new(info, state, gateway, handler, sender);
        tracing::debug!(connection_id = %session.info().id, "session opened");

        (
            Self {
                session,
                supervisor,
            },
            rx,
        )
    }

    /// Handles one inbound text frame. Protocol violations close the
    /// connection.
    pub async fn receive_text(&self, text: &str) {
        if let Err(violation) = self.session.handle_text(text).await {
            self.supervisor.close(&violation).await;
        }
    }

    /// Binary frames are not part of the protocol.
    pub async fn receive_binary(&self) {
        tracing::debug!(connection_id = %self.info().id, "binary frame received");
        self.supervisor.close(&ProtocolViolation::InvalidMessage).await;
    }

    /// Closes a connection that negotiated the legacy `graphql-ws` protocol.
    pub async fn reject_legacy_protocol(&self) {
        tracing::debug!(
            connection_id = %self.info().id,
            "legacy graphql-ws sub-protocol is not supported"
        );
        self.supervisor.close(&ProtocolViolation::InvalidMessage).await;
    }

    /// Closes the connection because the server is shutting down.
    pub async fn shutdown(&self) {
        self.supervisor
            .close_with(WS_CLOSE_GOING_AWAY, "Going away")
            .await;
    }

    /// Reports that the socket is gone. `peer_code` is the code the peer
    /// sent (or 1005/1006); a server-initiated close code takes precedence.
    pub async fn finish(&self, peer_code: u16) {
        self.supervisor.connection_closed(peer_code).await;
    }

    /// Cancelled once the connection stops accepting inbound frames.
    pub fn closing(&self) -> CancellationToken {
        self.session.sender().closed().clone()
    }

    pub fn info(&self) -> &ConnectionInfo {
        self.session.info()
    }

    pub fn state(&self) -> &SessionState {
        self.session.state()
    }
}
