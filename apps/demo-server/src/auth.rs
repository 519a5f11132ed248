//! Connection hooks for the demo: optional shared-token check and logging.

use graphwire_server::{ConnectionInfo, Handler, HandlerFuture, InitFuture, InitRejected};
use serde_json::Value;

#[derive(Debug, Default)]
pub struct TokenAuth {
    /// Required `token` in the init payload; `None` accepts everyone.
    pub token: Option<String>,
}

impl TokenAuth {
    fn check(&self, payload: Option<&Value>) -> Result<(), InitRejected> {
        let Some(expected) = &self.token else {
            return Ok(());
        };
        let offered = payload.and_then(|p| p.get("token")).and_then(Value::as_str);
        if offered == Some(expected.as_str()) {
            Ok(())
        } else {
            Err(InitRejected::new("missing or wrong token"))
        }
    }
}

impl Handler for TokenAuth {
    fn on_connection_init<'a>(
        &'a self,
        info: &'a ConnectionInfo,
        payload: Option<Value>,
    ) -> InitFuture<'a> {
        let res = self.check(payload.as_ref()).map(|()| None);
        if res.is_ok() {
            tracing::info!(connection_id = %info.id, remote = ?info.remote_addr, "client initialised");
        }
        Box::pin(async move { res })
    }

    fn on_subscription_cancelled<'a>(
        &'a self,
        info: &'a ConnectionInfo,
        id: &'a str,
    ) -> HandlerFuture<'a> {
        tracing::info!(connection_id = %info.id, operation_id = id, "operation completed by client");
        Box::pin(async {})
    }

    fn on_connection_closed<'a>(
        &'a self,
        info: &'a ConnectionInfo,
        code: u16,
        _init_payload: Option<Value>,
    ) -> HandlerFuture<'a> {
        tracing::info!(connection_id = %info.id, code, "client disconnected");
        Box::pin(async {})
    }
}
