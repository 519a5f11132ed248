//! Blocking transport: one OS thread per socket using the synchronous
//! tungstenite API.
//!
//! The connection thread owns the socket and is its only writer. It
//! alternates between draining the outbox and a short-timeout read. Inbound
//! frames are handed to a driver task on the supplied tokio runtime, which
//! runs the protocol for that connection in order.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use graphwire_protocol::constants::{
    WS_CLOSE_ABNORMAL, WS_CLOSE_NO_STATUS, WS_CLOSE_NORMAL,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};
use tokio_tungstenite::tungstenite::{self, Error as WsError, WebSocket};
use tokio_util::sync::CancellationToken;

use crate::ServerError;
use crate::connection::{Connection, Outbound};
use crate::gateway::ExecutionGateway;
use crate::handler::Handler;
use crate::handshake::{Handshake, ws_config};
use crate::lifecycle::Negotiation;
use crate::server::ServerConfig;

/// How long a connection thread blocks in a read before checking its outbox.
const READ_POLL: Duration = Duration::from_millis(10);

/// How long the accept loop sleeps when no connection is pending.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Frames handed from a connection thread to its driver task.
enum Inbound {
    Text(String),
    Binary,
    Shutdown,
    Closed(u16),
}

/// GraphQL over WebSocket server with a thread per connection.
///
/// Session work (hooks, gateway calls, operation streams) runs on the
/// tokio runtime behind `runtime`; the threads only move frames.
pub struct BlockingServer<G, H> {
    config: ServerConfig,
    gateway: Arc<G>,
    handler: Arc<H>,
    runtime: Handle,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    connections: AtomicUsize,
}

impl<G: ExecutionGateway, H: Handler> BlockingServer<G, H> {
    pub fn new(config: ServerConfig, gateway: G, handler: H, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            config,
            gateway: Arc::new(gateway),
            handler: Arc::new(handler),
            runtime,
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
            connections: AtomicUsize::new(0),
        })
    }

    /// Returns the local address once [`run`](Self::run) bound the socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the listening port (0 if not yet bound).
    pub fn port(&self) -> u16 {
        self.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Number of open WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Stops accepting and closes every connection with 1001.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the accept loop on the calling thread until
    /// [`shutdown`](Self::shutdown). Must not be called from inside the
    /// tokio runtime.
    pub fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);
        tracing::info!("graphql-ws blocking server listening on {local_addr}");

        while !self.cancel.is_cancelled() {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        tracing::error!(%peer_addr, "failed to configure accepted socket: {e}");
                        continue;
                    }
                    let server = Arc::clone(self);
                    let spawned = std::thread::Builder::new()
                        .name(format!("graphwire-{peer_addr}"))
                        .spawn(move || server.serve(stream, peer_addr));
                    if let Err(e) = spawned {
                        tracing::error!(%peer_addr, "failed to spawn connection thread: {e}");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
                Err(e) => tracing::error!("accept error: {e}"),
            }
        }

        tracing::info!("server shutting down");
        Ok(())
    }

    fn serve(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let mut handshake = Handshake::default();
        let accepted = tungstenite::accept_hdr_with_config(
            stream,
            |req: &Request, resp: Response| handshake.on_request(req, resp),
            Some(ws_config(self.config.max_message_size)),
        );
        let mut ws = match accepted {
            Ok(ws) => ws,
            Err(e) => {
                tracing::warn!(%peer_addr, "WebSocket handshake failed: {e}");
                return;
            }
        };
        let socket = ws.get_ref();
        let timeouts = socket
            .set_read_timeout(Some(READ_POLL))
            .and_then(|()| socket.set_write_timeout(Some(self.config.write_timeout)));
        if let Err(e) = timeouts {
            tracing::warn!(%peer_addr, "failed to set socket timeouts: {e}");
            return;
        }

        let (info, negotiation) = handshake.into_info(Some(peer_addr));
        let connection_id = info.id;
        tracing::info!(
            %connection_id,
            %peer_addr,
            subprotocol = ?info.subprotocol,
            "WebSocket connection established"
        );

        self.connections.fetch_add(1, Ordering::AcqRel);
        let (conn, mut outbox) = {
            let _rt = self.runtime.enter();
            Connection::open(
                info,
                Arc::clone(&self.gateway),
                Arc::clone(&self.handler),
                &self.config,
            )
        };
        let closing = conn.closing();
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let legacy = matches!(negotiation, Negotiation::Legacy(_));
        let driver = self.runtime.spawn(drive(conn, inbound_rx, legacy));

        let mut pump = SocketPump {
            ws: &mut ws,
            close_sent: None,
        };
        let mut shutdown_sent = false;
        let peer_code = loop {
            // Sample before draining: the close frame is queued before the
            // token is cancelled.
            let closing_seen = closing.is_cancelled();
            if let Err(code) = pump.drain(&mut outbox) {
                break code;
            }
            if closing_seen && pump.close_sent.is_none() {
                break WS_CLOSE_ABNORMAL;
            }
            if pump.close_sent.is_some_and(|at| at.elapsed() > self.config.write_timeout) {
                tracing::debug!(%connection_id, "peer did not answer close");
                break WS_CLOSE_ABNORMAL;
            }
            if !shutdown_sent && self.cancel.is_cancelled() {
                shutdown_sent = true;
                let _ = inbound.send(Inbound::Shutdown);
            }

            match pump.ws.read() {
                Ok(WsMessage::Text(text)) => {
                    let _ = inbound.send(Inbound::Text(text.as_str().to_owned()));
                }
                Ok(WsMessage::Binary(_)) => {
                    let _ = inbound.send(Inbound::Binary);
                }
                Ok(WsMessage::Close(frame)) => {
                    let _ = pump.ws.flush();
                    break frame.map_or(WS_CLOSE_NO_STATUS, |f| u16::from(f.code));
                }
                // Control frames are answered by tungstenite.
                Ok(_) => {}
                Err(WsError::Io(e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => break WS_CLOSE_NORMAL,
                Err(e) => {
                    tracing::debug!(%connection_id, "read error: {e}");
                    break WS_CLOSE_ABNORMAL;
                }
            }
        };

        // Releases a driver waiting on a full outbox.
        drop(outbox);
        let _ = inbound.send(Inbound::Closed(peer_code));
        if let Err(e) = self.runtime.block_on(driver) {
            tracing::error!(%connection_id, "connection driver failed: {e}");
        }
        self.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Writes outbox items to the socket from the connection thread. A write
/// blocked longer than the socket's write timeout fails the connection.
struct SocketPump<'a> {
    ws: &'a mut WebSocket<TcpStream>,
    /// When the close frame was written; later items are discarded.
    close_sent: Option<Instant>,
}

impl SocketPump<'_> {
    /// Writes every queued item. `Err` carries the close code to report
    /// when the socket failed.
    fn drain(&mut self, outbox: &mut mpsc::Receiver<Outbound>) -> Result<(), u16> {
        while let Ok(item) = outbox.try_recv() {
            if self.close_sent.is_some() {
                continue;
            }
            match item {
                Outbound::Text(text) => {
                    if let Err(e) = self.ws.send(WsMessage::Text(text.into())) {
                        tracing::debug!("send error: {e}");
                        return Err(WS_CLOSE_ABNORMAL);
                    }
                }
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame {
                        code: WsCloseCode::from(code),
                        reason: reason.into(),
                    };
                    if let Err(e) = self.ws.close(Some(frame)).and_then(|()| self.ws.flush()) {
                        tracing::debug!("close error: {e}");
                        return Err(WS_CLOSE_ABNORMAL);
                    }
                    self.close_sent = Some(Instant::now());
                }
            }
        }
        Ok(())
    }
}

/// Runs the protocol for one connection in frame order.
async fn drive<G, H>(
    conn: Connection<G, H>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    legacy: bool,
) where
    G: ExecutionGateway,
    H: Handler,
{
    if legacy {
        conn.reject_legacy_protocol().await;
    }
    while let Some(frame) = inbound.recv().await {
        match frame {
            Inbound::Text(text) => conn.receive_text(&text).await,
            Inbound::Binary => conn.receive_binary().await,
            Inbound::Shutdown => conn.shutdown().await,
            Inbound::Closed(code) => {
                conn.finish(code).await;
                return;
            }
        }
    }
    conn.finish(WS_CLOSE_ABNORMAL).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionInfo;
    use crate::gateway::{Execution, GatewayFuture};
    use crate::handler::DefaultHandler;
    use futures_util::{SinkExt, StreamExt, stream};
    use graphwire_protocol::{ExecutionResult, GraphQlError, GraphQlRequest, Message};
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};

    struct Greetings;

    impl ExecutionGateway for Greetings {
        fn execute(&self, _info: Arc<ConnectionInfo>, _request: GraphQlRequest) -> GatewayFuture<'_> {
            Box::pin(async {
                let items = ["Hi", "Bonjour", "Hola"].map(|g| {
                    Ok::<_, Vec<GraphQlError>>(ExecutionResult::data(json!({ "greetings": g })))
                });
                Ok(Execution::stream(stream::iter(items)))
            })
        }
    }

    async fn next_message<S>(ws: &mut S) -> WsMessage
    where
        S: futures_util::Stream<Item = Result<WsMessage, WsError>> + Unpin,
    {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                Some(Ok(msg)) => return msg,
                other => panic!("connection ended: {other:?}"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn greetings_then_shutdown() {
        let config = ServerConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..ServerConfig::default()
        };
        let server = BlockingServer::new(config, Greetings, DefaultHandler, Handle::current());
        let runner = Arc::clone(&server);
        let accept_thread = std::thread::spawn(move || runner.run());

        while server.port() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let url = format!("ws://127.0.0.1:{}/graphql", server.port());
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        ws.send(WsMessage::Text(r#"{"type":"connection_init"}"#.into()))
            .await
            .unwrap();
        let WsMessage::Text(ack) = next_message(&mut ws).await else {
            panic!("expected ack");
        };
        assert_eq!(Message::decode(ack.as_str()).unwrap(), Message::ack(None));

        ws.send(WsMessage::Text(
            r#"{"type":"subscribe","id":"g","payload":{"query":"subscription { greetings }"}}"#
                .into(),
        ))
        .await
        .unwrap();
        for g in ["Hi", "Bonjour", "Hola"] {
            let WsMessage::Text(text) = next_message(&mut ws).await else {
                panic!("expected next");
            };
            assert_eq!(
                Message::decode(text.as_str()).unwrap(),
                Message::next("g", ExecutionResult::data(json!({ "greetings": g })))
            );
        }
        let WsMessage::Text(done) = next_message(&mut ws).await else {
            panic!("expected complete");
        };
        assert_eq!(Message::decode(done.as_str()).unwrap(), Message::complete("g"));
        assert_eq!(server.connection_count(), 1);

        server.shutdown();
        let WsMessage::Close(Some(frame)) = next_message(&mut ws).await else {
            panic!("expected close");
        };
        assert_eq!(u16::from(frame.code), 1001);

        let joined = tokio::task::spawn_blocking(move || accept_thread.join())
            .await
            .unwrap();
        assert!(joined.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_that_stops_reading_is_dropped() {
        let config = ServerConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            send_buffer: 2,
            write_timeout: Duration::from_millis(200),
            ..ServerConfig::default()
        };
        let server = BlockingServer::new(config, Greetings, DefaultHandler, Handle::current());
        let runner = Arc::clone(&server);
        let accept_thread = std::thread::spawn(move || runner.run());

        while server.port() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let url = format!("ws://127.0.0.1:{}/graphql", server.port());
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        ws.send(WsMessage::Text(r#"{"type":"connection_init"}"#.into()))
            .await
            .unwrap();
        let WsMessage::Text(ack) = next_message(&mut ws).await else {
            panic!("expected ack");
        };
        assert_eq!(Message::decode(ack.as_str()).unwrap(), Message::ack(None));

        let (mut sink, _unread) = ws.split();
        let ping = json!({ "type": "ping", "payload": { "data": "x".repeat(256 * 1024) } })
            .to_string();
        let flood = tokio::spawn(async move {
            for _ in 0..256 {
                if sink.send(WsMessage::Text(ping.clone().into())).await.is_err() {
                    break;
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(500)).await;

        server.shutdown();
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while server.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(drained.is_ok(), "connection thread did not finish after shutdown");

        flood.abort();
        let joined = tokio::task::spawn_blocking(move || accept_thread.join())
            .await
            .unwrap();
        assert!(joined.unwrap().is_ok());
    }
}
