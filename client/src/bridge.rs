//! WebSocket exchanges on the agent side. The upgrade is replayed against the
//! local service, then a second socket back to the relay carries the
//! messages and the two are spliced together.

use std::sync::Arc;

use anyhow::{Context, Result};
use backhaul_shared::{bridge, headers, RequestHeader, ResponseFrame, ResponseHeader, TunnelTransport};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderName, HeaderValue};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, LocalTarget};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Headers the WebSocket handshake generates itself.
fn is_handshake_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("sec-websocket-key")
        || name.eq_ignore_ascii_case("sec-websocket-version")
        || name.eq_ignore_ascii_case("sec-websocket-extensions")
        || headers::is_hop_by_hop(name)
}

#[derive(Clone)]
pub struct WsBridge {
    config: Arc<AgentConfig>,
    client_id: String,
    target: Arc<LocalTarget>,
}

impl WsBridge {
    pub fn new(config: Arc<AgentConfig>, client_id: String, target: Arc<LocalTarget>) -> Self {
        Self {
            config,
            client_id,
            target,
        }
    }

    /// Run one bridged exchange to completion. A local service that refuses
    /// the upgrade is reported as 502 over `transport`.
    pub async fn open(&self, transport: &TunnelTransport<ResponseFrame>, header: RequestHeader) {
        let request_id = header.request_id.clone();

        let (origin, protocol) = match self.connect_origin(&header).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(request_id = %request_id, "Local WebSocket refused: {:#}", e);
                report_failure(transport, &request_id).await;
                return;
            }
        };

        let hop = match self.connect_hop(&request_id, protocol.as_deref()).await {
            Ok(hop) => hop,
            Err(e) => {
                warn!(request_id = %request_id, "Relay WebSocket hop failed: {:#}", e);
                let mut origin = origin;
                let _ = origin.close(None).await;
                report_failure(transport, &request_id).await;
                return;
            }
        };

        info!(request_id = %request_id, path = %header.path, protocol = ?protocol, "WebSocket bridged");
        bridge::splice(origin, hop).await;
        debug!(request_id = %request_id, "WebSocket bridge closed");
    }

    /// Open the origin hop. Also returns the sub-protocol the origin chose.
    async fn connect_origin(&self, header: &RequestHeader) -> Result<(Socket, Option<String>)> {
        let url = self.target.ws_url(&header.path)?;
        let mut request = url.as_str().into_client_request()?;

        // Host comes from the local URL.
        for (k, v) in header.headers.iter().filter(|(k, _)| !is_handshake_header(k)) {
            if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
                request.headers_mut().append(name, value);
            }
        }

        let (socket, response) = connect_async(request)
            .await
            .with_context(|| format!("connect {}", url))?;
        Ok((socket, accepted_protocol(response.headers())))
    }

    async fn connect_hop(&self, request_id: &str, protocol: Option<&str>) -> Result<Socket> {
        let url = self.config.ws_hop_url(&self.client_id, request_id, protocol)?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .context("connect relay hop")?;
        Ok(socket)
    }
}

fn accepted_protocol(headers: &HeaderMap) -> Option<String> {
    headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn report_failure(transport: &TunnelTransport<ResponseFrame>, request_id: &str) {
    let frame = ResponseFrame::Header(ResponseHeader::bad_gateway(request_id));
    if let Err(e) = transport.send(frame).await {
        debug!(request_id, "Failure report not delivered: {}", e);
    }
}
