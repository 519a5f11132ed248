//! One running GraphQL operation.

use std::sync::Arc;

use futures_util::StreamExt;
use graphwire_protocol::{ExecutionResult, GraphQlRequest, Message};
use tokio_util::sync::CancellationToken;

use super::SessionState;
use crate::connection::{ConnectionInfo, Sender};
use crate::gateway::{Execution, ExecutionGateway};

/// An accepted `subscribe`, registered under `id` with `serial`.
pub(super) struct Operation<G> {
    pub(super) id: String,
    pub(super) serial: u64,
    pub(super) request: GraphQlRequest,
    pub(super) token: CancellationToken,
    pub(super) info: Arc<ConnectionInfo>,
    pub(super) state: Arc<SessionState>,
    pub(super) gateway: Arc<G>,
    pub(super) sender: Sender,
}

impl<G: ExecutionGateway> Operation<G> {
    /// Executes the request and streams its results until it ends or is
    /// cancelled. A cancelled operation writes nothing further.
    pub(super) async fn run(self) {
        let Self {
            id,
            serial,
            request,
            token,
            info,
            state,
            gateway,
            sender,
        } = self;
        let connection_id = info.id;
        let out = Emitter {
            id: &id,
            serial,
            token: &token,
            state: &state,
            sender: &sender,
        };

        let execution = tokio::select! {
            biased;
            () = token.cancelled() => {
                tracing::debug!(%connection_id, operation_id = %id, "cancelled before execution");
                return;
            }
            res = gateway.execute(Arc::clone(&info), request) => res,
        };

        match execution {
            Err(rejected) => {
                tracing::debug!(%connection_id, operation_id = %id, "{rejected}");
                out.terminate(Message::error(id.as_str(), rejected.errors)).await;
            }
            Ok(Execution::Single(result)) => {
                if out.next(result).await {
                    out.terminate(Message::complete(id.as_str())).await;
                }
            }
            Ok(Execution::Stream(mut stream)) => loop {
                let item = tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        tracing::debug!(%connection_id, operation_id = %id, "stream cancelled");
                        return;
                    }
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(result)) => {
                        if !out.next(result).await {
                            return;
                        }
                    }
                    Some(Err(errors)) => {
                        tracing::debug!(
                            %connection_id,
                            operation_id = %id,
                            errors = errors.len(),
                            "stream failed"
                        );
                        out.terminate(Message::error(id.as_str(), errors)).await;
                        return;
                    }
                    None => {
                        out.terminate(Message::complete(id.as_str())).await;
                        return;
                    }
                }
            },
        }
    }
}

struct Emitter<'a> {
    id: &'a str,
    serial: u64,
    token: &'a CancellationToken,
    state: &'a SessionState,
    sender: &'a Sender,
}

impl Emitter<'_> {
    /// Queues a `next`. Returns `false` once the operation is cancelled or
    /// the connection is gone.
    async fn next(&self, result: ExecutionResult) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let msg = Message::next(self.id, result);
        tokio::select! {
            biased;
            () = self.token.cancelled() => false,
            res = self.sender.send_msg(&msg) => res.is_ok(),
        }
    }

    /// Deregisters the operation, then queues its terminal frame. Nothing
    /// is sent if the registration was already cancelled or replaced.
    async fn terminate(&self, msg: Message) {
        if !self.state.finish(self.id, self.serial) {
            return;
        }
        if self.sender.send_msg(&msg).await.is_err() {
            tracing::trace!(operation_id = %self.id, "terminal {} dropped", msg.kind());
        }
    }
}
