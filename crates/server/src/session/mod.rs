//! The `graphql-transport-ws` protocol handler.
//!
//! Decodes inbound text frames and applies the transition table. Every
//! violation is returned to the caller, which closes the connection; the
//! session itself never touches the socket except through its [`Sender`].

mod operation;
mod state;

use std::sync::Arc;

use graphwire_protocol::{GraphQlRequest, Message};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionInfo, Sender};
use crate::gateway::ExecutionGateway;
use crate::handler::Handler;
use crate::violation::ProtocolViolation;
use operation::Operation;

pub use state::{Phase, SessionState};

pub(crate) struct Session<G, H> {
    info: Arc<ConnectionInfo>,
    state: Arc<SessionState>,
    gateway: Arc<G>,
    handler: Arc<H>,
    sender: Sender,
}

impl<G: ExecutionGateway, H: Handler> Session<G, H> {
    pub(crate) fn new(
        info: Arc<ConnectionInfo>,
        state: Arc<SessionState>,
        gateway: Arc<G>,
        handler: Arc<H>,
        sender: Sender,
    ) -> Self {
        Self {
            info,
            state,
            gateway,
            handler,
            sender,
        }
    }

    pub(crate) fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub(crate) fn state(&self) -> &SessionState {
        &self.state
    }

    pub(crate) fn sender(&self) -> &Sender {
        &self.sender
    }

    /// Handles one inbound text frame. Frames arriving after the connection
    /// started closing are dropped.
    pub(crate) async fn handle_text(&self, text: &str) -> Result<(), ProtocolViolation> {
        if self.state.phase() >= Phase::Closing {
            return Ok(());
        }
        let msg = Message::decode(text).map_err(|e| {
            tracing::debug!(connection_id = %self.info.id, "{e}");
            ProtocolViolation::InvalidMessage
        })?;
        tracing::trace!(connection_id = %self.info.id, kind = %msg.kind(), "received");

        match msg {
            Message::ConnectionInit { payload } => self.connection_init(payload).await,
            Message::Ping { payload } => {
                self.reply(&Message::pong(payload)).await;
                Ok(())
            }
            Message::Pong { .. } => Ok(()),
            Message::Subscribe { id, payload } => self.subscribe(id, payload),
            Message::Complete { id } => {
                if self.state.cancel(&id) {
                    tracing::debug!(connection_id = %self.info.id, operation_id = %id, "completed by client");
                    self.handler
                        .on_subscription_cancelled(&self.info, &id)
                        .await;
                }
                Ok(())
            }
            Message::ConnectionAck { .. }
            | Message::Next { .. }
            | Message::Error { .. }
            | Message::Unknown => {
                tracing::debug!(
                    connection_id = %self.info.id,
                    kind = %msg.kind(),
                    "message not accepted from a client"
                );
                Err(ProtocolViolation::InvalidMessage)
            }
        }
    }

    async fn connection_init(&self, payload: Option<Value>) -> Result<(), ProtocolViolation> {
        self.state.set_init_payload(payload.clone())?;

        match self.handler.on_connection_init(&self.info, payload).await {
            Ok(ack_payload) => {
                if self.state.acknowledge() {
                    tracing::debug!(connection_id = %self.info.id, "connection acknowledged");
                    self.reply(&Message::ack(ack_payload)).await;
                }
                Ok(())
            }
            Err(rejected) => {
                tracing::info!(connection_id = %self.info.id, "{rejected}");
                Err(ProtocolViolation::Unauthorized)
            }
        }
    }

    fn subscribe(
        &self,
        id: Option<String>,
        request: GraphQlRequest,
    ) -> Result<(), ProtocolViolation> {
        if !self.state.is_acknowledged() {
            return Err(ProtocolViolation::Unauthorized);
        }
        let id = id
            .filter(|id| !id.is_empty())
            .ok_or(ProtocolViolation::InvalidMessage)?;

        let token = CancellationToken::new();
        let serial = self.state.register(&id, token.clone())?;
        tracing::debug!(connection_id = %self.info.id, operation_id = %id, "subscribe");

        let op = Operation {
            id,
            serial,
            request,
            token,
            info: Arc::clone(&self.info),
            state: Arc::clone(&self.state),
            gateway: Arc::clone(&self.gateway),
            sender: self.sender.clone(),
        };
        tokio::spawn(op.run());
        Ok(())
    }

    async fn reply(&self, msg: &Message) {
        if self.sender.send_msg(msg).await.is_err() {
            tracing::trace!(connection_id = %self.info.id, "{} dropped, connection closing", msg.kind());
        }
    }
}
