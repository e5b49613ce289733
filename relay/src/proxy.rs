//! HTTP handlers: the agent control endpoints and the public proxy fallback.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{Body, BodyDataStream, HttpBody},
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{
        header::{HeaderName, HeaderValue, AUTHORIZATION},
        HeaderMap, Request, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use backhaul_shared::protocol::MAX_MESSAGE_SIZE;
use backhaul_shared::{bridge, headers, Error, HeaderList, RequestFrame, TunnelTransport, WireMessage};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::exchange::{Exchanges, Outcome, ProxiedResponse};
use crate::registry::{session_key, AgentConnection};
use crate::AppState;

/// Query string shared by the agent-facing endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct AgentQuery {
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
    pub token: Option<String>,
    /// Sub-protocol the origin accepted on a WebSocket hop.
    pub protocol: Option<String>,
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PingReply {
    pub ok: bool,
    pub code: u16,
    pub message: String,
}

pub fn error_response(err: &Error) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, err.to_string()).into_response()
}

fn bad_request(message: &'static str) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}

/// `GET /__connect__?clientId=..&token=..`: an agent opens its tunnel.
pub async fn connect_agent(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(client_id) = present(query.client_id) else {
        return bad_request("clientId is required");
    };
    if !state.auth.connection_allowed(query.token.as_deref()) {
        warn!(client_id = %client_id, "Agent rejected: bad connection token");
        return error_response(&Error::Unauthorized);
    }
    let Some(ws) = ws else {
        return bad_request("expected a WebSocket upgrade");
    };

    let span = info_span!("agent", client_id = %client_id);
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| serve_agent(state, client_id, socket).instrument(span))
}

async fn serve_agent(state: AppState, client_id: String, socket: WebSocket) {
    let (transport, io) = TunnelTransport::<RequestFrame>::new();
    let exchanges = Arc::new(Exchanges::new(transport.clone()));
    let serial = state.next_serial();
    let conn = AgentConnection::new(client_id.clone(), serial, transport, exchanges.clone());

    if let Some(old) = state.registry.insert(conn).await {
        warn!("Agent reconnected under the same id, closing the previous socket");
        old.transport.close();
    }
    let agents = state.registry.len().await;
    info!(agents, "Agent connected");

    let (sink, stream) = socket.split();
    let sink = sink.with(|msg: WireMessage| async move { Ok::<_, axum::Error>(to_axum(msg)) });
    let stream = stream.map(|msg| msg.map(from_axum));
    io.run(sink, stream, exchanges).await;

    state.registry.remove(&client_id, serial).await;
    let agents = state.registry.len().await;
    info!(agents, "Agent disconnected");
}

fn to_axum(msg: WireMessage) -> Message {
    match msg {
        WireMessage::Text(text) => Message::Text(text),
        WireMessage::Binary(data) => Message::Binary(data),
        WireMessage::Keepalive => Message::Ping(Vec::new()),
        WireMessage::Close => Message::Close(None),
    }
}

fn from_axum(msg: Message) -> WireMessage {
    match msg {
        Message::Text(text) => WireMessage::Text(text),
        Message::Binary(data) => WireMessage::Binary(data),
        Message::Ping(_) | Message::Pong(_) => WireMessage::Keepalive,
        Message::Close(_) => WireMessage::Close,
    }
}

/// `GET /__ping__?clientId=..`: out-of-band check whether the relay still
/// holds a connection for an agent.
pub async fn ping_agent(State(state): State<AppState>, Query(query): Query<AgentQuery>) -> Response {
    let (code, message) = match present(query.client_id) {
        None => (StatusCode::BAD_REQUEST, "clientId is required"),
        Some(id) if state.registry.get(&id).await.is_some() => (StatusCode::OK, "connected"),
        Some(_) => (StatusCode::NOT_FOUND, "agent not connected"),
    };
    let reply = PingReply {
        ok: code.is_success(),
        code: code.as_u16(),
        message: message.to_string(),
    };
    (code, Json(reply)).into_response()
}

/// `GET /__ws__?clientId=..&requestId=..&token=..&protocol=..`: the agent's
/// second hop for a WebSocket exchange it accepted.
pub async fn agent_ws_hop(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let (Some(client_id), Some(request_id)) = (present(query.client_id), present(query.request_id)) else {
        return bad_request("clientId and requestId are required");
    };
    if !state.auth.connection_allowed(query.token.as_deref()) {
        return error_response(&Error::Unauthorized);
    }
    let conn = match state.registry.get(&client_id).await {
        Some(conn) if conn.exchanges.is_pending(&request_id) => conn,
        _ => return (StatusCode::NOT_FOUND, "no pending exchange").into_response(),
    };
    let Some(ws) = ws else {
        return bad_request("expected a WebSocket upgrade");
    };

    let protocol = present(query.protocol);
    ws.on_upgrade(move |socket| async move {
        if let Err(Outcome::WebSocket { socket, .. }) =
            conn.exchanges.resolve(&request_id, Outcome::WebSocket { socket, protocol })
        {
            debug!(request_id = %request_id, "Exchange ended before its hop attached");
            let _ = socket.close().await;
        }
    })
}

/// Fallback: every other request is tunneled to an agent.
pub async fn forward(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    ws: Option<WebSocketUpgrade>,
    req: Request<Body>,
) -> Response {
    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let authorization = parts.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    if !state.auth.request_allowed(&path, authorization) {
        return error_response(&Error::Unauthorized);
    }

    let mut headers = header_list(&parts.headers);
    let peer = peer.map(|ConnectInfo(addr)| addr);
    let Some(conn) = state.registry.select(&session_key(&headers, peer)).await else {
        debug!(path = %path, "No agent connected");
        return error_response(&Error::NoAgentAvailable);
    };

    let method = parts.method.as_str().to_string();
    let upgrade = headers::is_websocket_upgrade(&method, &headers);
    let client_ip = peer.map(|addr| addr.ip().to_string());
    state.forwarded.rewrite_request(&mut headers, client_ip.as_deref());

    if upgrade {
        let Some(ws) = ws else {
            return bad_request("WebSocket upgrade not possible on this connection");
        };
        return match state
            .mux
            .dispatch(&conn.exchanges, method, path, headers, None::<BodyDataStream>)
            .await
        {
            Ok(Outcome::WebSocket { socket: hop, protocol }) => {
                accept_protocol(ws, protocol).on_upgrade(|client| async move {
                    bridge::splice(client, hop).await;
                    debug!("WebSocket exchange closed");
                })
            }
            Ok(Outcome::Response(response)) => into_response(response),
            Err(e) => error_response(&e),
        };
    }

    headers::strip_hop_by_hop(&mut headers);
    let body = if body.is_end_stream() {
        None
    } else {
        Some(body.into_data_stream())
    };
    match state.mux.dispatch(&conn.exchanges, method, path, headers, body).await {
        Ok(Outcome::Response(response)) => into_response(response),
        Ok(Outcome::WebSocket { socket: hop, .. }) => {
            warn!("Agent attached a WebSocket hop to a plain HTTP request");
            let _ = hop.close().await;
            error_response(&Error::BadGateway("unexpected WebSocket hop".to_string()))
        }
        Err(e) => error_response(&e),
    }
}

fn header_list(map: &HeaderMap) -> HeaderList {
    map.iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str().to_string(), val.to_string())))
        .collect()
}

/// Answer the caller with the sub-protocol the origin picked, or with none.
fn accept_protocol(ws: WebSocketUpgrade, protocol: Option<String>) -> WebSocketUpgrade {
    match protocol {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    }
}

fn into_response(response: ProxiedResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    if let Some(headers_mut) = builder.headers_mut() {
        for (k, v) in &response.headers {
            if headers::is_hop_by_hop(k) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
                headers_mut.append(name, value);
            }
        }
    }
    let body = match response.body {
        Some(stream) => Body::from_stream(stream),
        None => Body::empty(),
    };
    match builder.body(body) {
        Ok(r) => r,
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Response build error").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_keeps_repeated_headers() {
        let response = into_response(ProxiedResponse {
            status: 201,
            status_text: "Created".into(),
            headers: vec![
                ("set-cookie".into(), "a=1".into()),
                ("set-cookie".into(), "b=2".into()),
                ("transfer-encoding".into(), "chunked".into()),
            ],
            body: None,
        });
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get_all("set-cookie").iter().count(), 2);
        assert!(response.headers().get("transfer-encoding").is_none());
    }

    fn assert_send<F>(_: fn(AppState, String, WebSocket) -> F)
    where
        F: std::future::Future + Send,
    {
    }

    #[test]
    fn test_agent_session_is_send() {
        // axum's upgrade callback needs a Send future.
        assert_send(serve_agent);
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(error_response(&Error::NoAgentAvailable).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_response(&Error::GatewayTimeout).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(error_response(&Error::ConnectionLost).status(), StatusCode::BAD_GATEWAY);
    }
}
