//! Async transport: a tokio TCP listener that upgrades every connection to
//! WebSocket and drives it with a read pump and a write pump.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use graphwire_protocol::constants::{
    DEFAULT_CONNECTION_INIT_TIMEOUT, WS_CLOSE_ABNORMAL, WS_CLOSE_NO_STATUS, WS_MAX_MESSAGE_SIZE,
    WS_WRITE_WAIT,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, Outbound};
use crate::gateway::ExecutionGateway;
use crate::handler::Handler;
use crate::handshake::{Handshake, ws_config};
use crate::lifecycle::Negotiation;
use crate::{SEND_BUFFER_SIZE, ServerError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// How long a client may take to send `connection_init`.
    pub connection_init_timeout: Duration,
    /// Interval between server `ping` messages; `None` disables them.
    pub keep_alive: Option<Duration>,
    /// Largest inbound message accepted at the WebSocket layer.
    pub max_message_size: usize,
    /// Outbound queue capacity per connection.
    pub send_buffer: usize,
    /// Longest a single socket write may block, and how long the peer gets
    /// to answer our close frame. A peer that stops reading is dropped
    /// with 1006 after this.
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            connection_init_timeout: DEFAULT_CONNECTION_INIT_TIMEOUT,
            keep_alive: None,
            max_message_size: WS_MAX_MESSAGE_SIZE,
            send_buffer: SEND_BUFFER_SIZE,
            write_timeout: WS_WRITE_WAIT,
        }
    }
}

/// GraphQL over WebSocket server on tokio.
///
/// Every accepted socket gets its own [`Connection`]; operations of one
/// connection never wait on another connection.
pub struct GraphQlWsServer<G, H> {
    config: ServerConfig,
    gateway: Arc<G>,
    handler: Arc<H>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    connections: AtomicUsize,
}

impl<G: ExecutionGateway, H: Handler> GraphQlWsServer<G, H> {
    pub fn new(config: ServerConfig, gateway: G, handler: H) -> Arc<Self> {
        Arc::new(Self {
            config,
            gateway: Arc::new(gateway),
            handler: Arc::new(handler),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
            connections: AtomicUsize::new(0),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Number of open WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Stops accepting and closes every connection with 1001.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the accept loop until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("graphql-ws server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::warn!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut handshake = Handshake::default();
        let ws_stream = accept_hdr_async_with_config(
            stream,
            |req: &Request, resp: Response| handshake.on_request(req, resp),
            Some(ws_config(self.config.max_message_size)),
        )
        .await?;
        let (info, negotiation) = handshake.into_info(Some(peer_addr));
        tracing::info!(
            connection_id = %info.id,
            %peer_addr,
            subprotocol = ?info.subprotocol,
            "WebSocket connection established"
        );

        self.connections.fetch_add(1, Ordering::AcqRel);
        let (conn, rx) = Connection::open(
            info,
            Arc::clone(&self.gateway),
            Arc::clone(&self.handler),
            &self.config,
        );
        let (sink, stream) = ws_stream.split();

        let stop = CancellationToken::new();
        let lost = CancellationToken::new();
        let write_timeout = self.config.write_timeout;
        let writer = tokio::spawn(write_pump(sink, rx, write_timeout, stop.clone(), lost.clone()));

        if matches!(negotiation, Negotiation::Legacy(_)) {
            conn.reject_legacy_protocol().await;
        }

        let peer_code = read_pump(stream, &conn, write_timeout, &self.cancel, &lost).await;
        conn.finish(peer_code).await;

        stop.cancel();
        if tokio::time::timeout(write_timeout, writer).await.is_err() {
            tracing::warn!(connection_id = %conn.info().id, "write pump did not stop in time");
        }
        self.connections.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Write pump: the only writer of the socket. Drains the outbox in order
/// and stops after the close frame.
///
/// A write that does not finish within `write_timeout` marks the socket
/// lost. Returning drops the outbox, which releases every task waiting to
/// queue a frame.
async fn write_pump<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
    stop: CancellationToken,
    lost: CancellationToken,
) where
    S: Sink<WsMessage, Error = WsError> + Send + Unpin,
{
    loop {
        tokio::select! {
            biased;

            item = rx.recv() => {
                match item {
                    Some(Outbound::Text(text)) => {
                        let frame = WsMessage::Text(text.into());
                        if let Err(e) = send_frame(&mut sink, frame, write_timeout).await {
                            tracing::debug!("write pump send error: {e}");
                            lost.cancel();
                            return;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let frame = CloseFrame {
                            code: WsCloseCode::from(code),
                            reason: reason.into(),
                        };
                        let frame = WsMessage::Close(Some(frame));
                        if let Err(e) = send_frame(&mut sink, frame, write_timeout).await {
                            tracing::debug!("write pump close error: {e}");
                            lost.cancel();
                        }
                        return;
                    }
                    None => break,
                }
            }

            _ = stop.cancelled() => break,
        }
    }

    // Best-effort close frame.
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
}

/// Sends one frame, failing with `TimedOut` if the peer does not drain the
/// socket within `wait`.
async fn send_frame<S>(sink: &mut S, frame: WsMessage, wait: Duration) -> Result<(), WsError>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    match tokio::time::timeout(wait, sink.send(frame)).await {
        Ok(sent) => sent,
        Err(_) => Err(WsError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "socket write timed out",
        ))),
    }
}

/// Runs `work` unless the socket is lost first. Returns `false` if it was.
async fn unless_lost(lost: &CancellationToken, work: impl Future<Output = ()>) -> bool {
    tokio::select! {
        () = work => true,
        () = lost.cancelled() => false,
    }
}

/// Read pump: feeds inbound frames to the connection until the socket
/// closes. Returns the close code to report for the peer.
async fn read_pump<S, G, H>(
    mut stream: S,
    conn: &Connection<G, H>,
    write_timeout: Duration,
    shutdown: &CancellationToken,
    lost: &CancellationToken,
) -> u16
where
    S: Stream<Item = Result<WsMessage, WsError>> + Send + Unpin,
    G: ExecutionGateway,
    H: Handler,
{
    let closing = conn.closing();
    // Once our close frame is queued the peer gets a bounded time to answer.
    let close_deadline = async {
        closing.cancelled().await;
        tokio::time::sleep(write_timeout).await;
    };
    tokio::pin!(close_deadline);
    let mut shutting_down = false;

    loop {
        tokio::select! {
            _ = lost.cancelled() => return WS_CLOSE_ABNORMAL,

            _ = &mut close_deadline => {
                tracing::debug!(connection_id = %conn.info().id, "peer did not answer close");
                return WS_CLOSE_ABNORMAL;
            }

            _ = shutdown.cancelled(), if !shutting_down => {
                shutting_down = true;
                if !unless_lost(lost, conn.shutdown()).await {
                    return WS_CLOSE_ABNORMAL;
                }
            }

            frame = stream.next() => {
                // Handling may wait on a full outbox; a lost socket ends the wait.
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if !unless_lost(lost, conn.receive_text(text.as_str())).await {
                            return WS_CLOSE_ABNORMAL;
                        }
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        if !unless_lost(lost, conn.receive_binary()).await {
                            return WS_CLOSE_ABNORMAL;
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        return frame.map_or(WS_CLOSE_NO_STATUS, |f| u16::from(f.code));
                    }
                    // Control frames are answered by tungstenite.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %conn.info().id, "read pump error: {e}");
                        return WS_CLOSE_ABNORMAL;
                    }
                    None => return WS_CLOSE_ABNORMAL,
                }
            }
        }
    }
}
