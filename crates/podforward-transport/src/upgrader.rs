//! WebSocket upgrade negotiation for the port-forward subresource

use http::header::{
    HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{request, Response, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::error::{TransportError, TransportResult};

/// Binary channel sub-protocol spoken by the kubelet streaming server
pub const PORT_FORWARD_PROTOCOL: &str = "v4.channel.k8s.io";

/// Largest rejection body we keep for the error message
const MAX_REJECTION_BODY: usize = 4096;

/// Largest rejection body we read at all
const MAX_REJECTION_READ: usize = 64 * 1024;

/// An upgraded connection to the API server
pub type UpgradedConnection = WebSocketStream<TokioIo<Upgraded>>;

/// Negotiates the WebSocket upgrade of a port-forward request
#[derive(Debug, Clone)]
pub struct Upgrader {
    protocol: HeaderValue,
}

impl Default for Upgrader {
    fn default() -> Self {
        Self::new()
    }
}

impl Upgrader {
    pub fn new() -> Self {
        Self {
            protocol: HeaderValue::from_static(PORT_FORWARD_PROTOCOL),
        }
    }

    /// Add the upgrade headers to a request.
    ///
    /// Returns the builder together with the `Sec-WebSocket-Key` the response
    /// must be verified against.
    pub fn prepare(&self, builder: request::Builder) -> (request::Builder, String) {
        let key = generate_key();
        let builder = builder
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .header(SEC_WEBSOCKET_KEY, key.as_str())
            .header(SEC_WEBSOCKET_PROTOCOL, self.protocol.clone());
        (builder, key)
    }

    /// Complete the upgrade from the server's response
    pub async fn upgrade(
        &self,
        response: Response<Incoming>,
        key: &str,
    ) -> TransportResult<UpgradedConnection> {
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(rejection(response).await);
        }

        self.verify(&response, key)?;

        let upgraded = hyper::upgrade::on(response)
            .await
            .map_err(|e| TransportError::HandshakeError(format!("upgrade failed: {}", e)))?;

        debug!("Connection upgraded to {}", PORT_FORWARD_PROTOCOL);

        Ok(WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Client, None).await)
    }

    fn verify<B>(&self, response: &Response<B>, key: &str) -> TransportResult<()> {
        let headers = response.headers();

        let upgrade = headers
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(TransportError::HandshakeError(format!(
                "unexpected Upgrade header '{}'",
                upgrade
            )));
        }

        let expected = derive_accept_key(key.as_bytes());
        if headers.get(SEC_WEBSOCKET_ACCEPT).map(|v| v.as_bytes()) != Some(expected.as_bytes()) {
            return Err(TransportError::HandshakeError(
                "Sec-WebSocket-Accept mismatch".to_string(),
            ));
        }

        if let Some(protocol) = headers.get(SEC_WEBSOCKET_PROTOCOL) {
            if *protocol != self.protocol {
                return Err(TransportError::HandshakeError(format!(
                    "server selected unsupported protocol {:?}",
                    protocol
                )));
            }
        }

        Ok(())
    }
}

/// Body of a Kubernetes `Status` object, as returned on rejected upgrades
#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    message: String,
}

async fn rejection<B>(response: Response<B>) -> TransportError
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let status = response.status();

    let body = match Limited::new(response.into_body(), MAX_REJECTION_READ)
        .collect()
        .await
    {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            return TransportError::UpgradeRejected {
                status,
                message: format!(
                    "{} (response body larger than {} bytes)",
                    status.canonical_reason().unwrap_or("unknown"),
                    MAX_REJECTION_READ
                ),
            }
        }
        Err(e) => {
            return TransportError::UpgradeRejected {
                status,
                message: format!("failed to read response body: {}", e),
            }
        }
    };

    TransportError::UpgradeRejected {
        status,
        message: rejection_message(status, &body),
    }
}

fn rejection_message(status: StatusCode, body: &[u8]) -> String {
    if let Ok(parsed) = serde_json::from_slice::<Status>(body) {
        if !parsed.message.is_empty() {
            return parsed.message;
        }
    }

    let text = String::from_utf8_lossy(&body[..body.len().min(MAX_REJECTION_BODY)]);
    let text = text.trim();
    if text.is_empty() {
        status.canonical_reason().unwrap_or("unknown").to_string()
    } else {
        text.to_string()
    }
}
