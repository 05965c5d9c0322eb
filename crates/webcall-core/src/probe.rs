//! Signalling endpoint reachability
//!
//! Before re-registering after a network outage the transport opens a
//! throwaway WebSocket to the signalling server. A completed handshake only
//! proves the server is reachable again; whether registration succeeds is
//! found out afterwards.

use std::time::Duration;

use async_trait::async_trait;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tracing::{debug, trace};

use crate::backoff::with_timeout;
use crate::error::{ClientError, ClientResult};

/// WebSocket subprotocol for SIP (RFC 7118)
const SIP_SUBPROTOCOL: &str = "sip";

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Succeeds if a connection to `url` can be established within `timeout`
    async fn probe(&self, url: &str, timeout: Duration) -> ClientResult<()>;
}

/// Probe that performs a real WebSocket handshake and closes right after
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketProbe;

#[async_trait]
impl ReachabilityProbe for WebSocketProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> ClientResult<()> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ClientError::network(format!("invalid websocket url {}: {}", url, e)))?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SIP_SUBPROTOCOL));

        trace!(url, "Probing signalling server");
        let (mut stream, _response) = with_timeout("websocket probe", timeout, async {
            connect_async(request)
                .await
                .map_err(|e| ClientError::network(format!("websocket connection to {} failed: {}", url, e)))
        })
        .await?;

        if let Err(e) = stream.close(None).await {
            debug!(url, error = %e, "Probe socket did not close cleanly");
        }
        Ok(())
    }
}
