//! Captures request metadata and negotiates the sub-protocol during the
//! WebSocket upgrade. Shared by both transports.

use std::net::SocketAddr;

use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use uuid::Uuid;

use crate::connection::ConnectionInfo;
use crate::lifecycle::{Negotiation, negotiate_subprotocol};

#[derive(Debug, Default)]
pub(crate) struct Handshake {
    uri: String,
    headers: Vec<(String, String)>,
    negotiation: Negotiation,
}

impl Handshake {
    /// Upgrade callback: records the request and echoes the negotiated
    /// sub-protocol. Never refuses the upgrade; protocol errors are
    /// reported with a close code once the socket is open.
    pub(crate) fn on_request(
        &mut self,
        request: &Request,
        mut response: Response,
    ) -> Result<Response, ErrorResponse> {
        self.uri = request.uri().to_string();
        self.headers = request
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_owned(), v.to_owned()))
            })
            .collect();

        let offered = request
            .headers()
            .get_all(SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|v| v.to_str().ok());
        self.negotiation = negotiate_subprotocol(offered);

        if let Some(protocol) = self.negotiation.response_protocol() {
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(protocol));
        }
        Ok(response)
    }

    pub(crate) fn into_info(self, remote_addr: Option<SocketAddr>) -> (ConnectionInfo, Negotiation) {
        let info = ConnectionInfo {
            id: Uuid::new_v4(),
            subprotocol: self.negotiation.response_protocol().map(str::to_owned),
            remote_addr,
            uri: self.uri,
            headers: self.headers,
        };
        (info, self.negotiation)
    }
}

/// WebSocket limits for an accepted socket.
pub(crate) fn ws_config(max_message_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(protocols: &[&str]) -> Request {
        let mut builder = Request::builder()
            .uri("/graphql?x=1")
            .header("Authorization", "Bearer abc");
        for p in protocols {
            builder = builder.header(SEC_WEBSOCKET_PROTOCOL, *p);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn selects_transport_ws_and_captures_request() {
        let mut hs = Handshake::default();
        let resp = hs
            .on_request(&request(&["graphql-transport-ws"]), Response::new(()))
            .unwrap();
        assert_eq!(
            resp.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
            "graphql-transport-ws"
        );

        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let (info, negotiation) = hs.into_info(Some(addr));
        assert!(matches!(negotiation, Negotiation::Selected(_)));
        assert_eq!(info.subprotocol.as_deref(), Some("graphql-transport-ws"));
        assert_eq!(info.uri, "/graphql?x=1");
        assert_eq!(info.header("authorization"), Some("Bearer abc"));
        assert_eq!(info.remote_addr, Some(addr));
    }

    #[test]
    fn echoes_legacy_protocol() {
        let mut hs = Handshake::default();
        let resp = hs
            .on_request(&request(&["graphql-ws"]), Response::new(()))
            .unwrap();
        assert_eq!(resp.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(), "graphql-ws");
        let (_, negotiation) = hs.into_info(None);
        assert!(matches!(negotiation, Negotiation::Legacy(_)));
    }

    #[test]
    fn no_offer_selects_nothing() {
        let mut hs = Handshake::default();
        let resp = hs.on_request(&request(&[]), Response::new(())).unwrap();
        assert!(resp.headers().get(SEC_WEBSOCKET_PROTOCOL).is_none());
        let (info, negotiation) = hs.into_info(None);
        assert_eq!(negotiation, Negotiation::Accepted);
        assert!(info.subprotocol.is_none());
    }
}
