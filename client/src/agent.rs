//! One agent connection: connect, serve frames until the link drops, then
//! reconnect according to how it ended.

use std::sync::Arc;

use anyhow::Result;
use backhaul_shared::{Disconnect, ResponseFrame, TunnelTransport, WireMessage};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, http::StatusCode, Message};
use tracing::{error, info, warn};

use crate::bridge::WsBridge;
use crate::config::{AgentConfig, LocalTarget};
use crate::dispatcher::Dispatcher;
use crate::liveness::{self, reconnect_delay, Expiry, LinkState, Liveness, SessionEnd};

pub struct Agent {
    config: Arc<AgentConfig>,
    client_id: String,
    http: reqwest::Client,
    target: Arc<LocalTarget>,
    liveness: Liveness,
}

impl Agent {
    pub fn new(config: Arc<AgentConfig>, client_id: String) -> Result<Self> {
        let target = Arc::new(config.local_target()?);
        // Redirects belong to the public caller.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            config,
            client_id,
            http,
            target,
            liveness: Liveness::new(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> LinkState {
        self.liveness.state()
    }

    /// Keep a connection up until the relay refuses the token.
    pub async fn run(&self) {
        loop {
            let end = self.session().await;
            self.liveness.set_state(LinkState::Disconnected);
            match reconnect_delay(end) {
                None => {
                    error!("Relay rejected the connection token, not reconnecting");
                    return;
                }
                Some(delay) if delay.is_zero() => info!("Disconnected, reconnecting"),
                Some(delay) => {
                    info!("Reconnecting in {}s", delay.as_secs());
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn session(&self) -> SessionEnd {
        self.liveness.set_state(LinkState::Connecting);
        let url = match self.config.connect_url(&self.client_id) {
            Ok(url) => url,
            Err(e) => {
                error!("{:#}", e);
                return SessionEnd::ConnectFailed;
            }
        };

        let socket = match connect_async(url.as_str()).await {
            Ok((socket, _)) => socket,
            Err(tungstenite::Error::Http(resp)) if resp.status() == StatusCode::UNAUTHORIZED => {
                return SessionEnd::Unauthorized;
            }
            Err(e) => {
                warn!("Cannot reach relay at {}: {}", self.config.remote_url, e);
                return SessionEnd::ConnectFailed;
            }
        };
        info!("Connected to {}", self.config.remote_url);
        self.liveness.set_state(LinkState::Open);

        let (transport, io) = TunnelTransport::<ResponseFrame>::new();
        let bridge = WsBridge::new(self.config.clone(), self.client_id.clone(), self.target.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            transport.clone(),
            self.http.clone(),
            self.target.clone(),
            bridge,
            self.liveness.clone(),
        ));

        let (sink, stream) = socket.split();
        let sink = sink.with(|msg: WireMessage| async move { Ok::<_, tungstenite::Error>(to_tungstenite(msg)) });
        let stream = stream.map(|msg| msg.map(from_tungstenite));

        let io = io.run(sink, stream, dispatcher);
        let watch = self.liveness.watch(&transport, self.config.ping_interval());
        let probe = self.probe();
        tokio::pin!(io, watch, probe);
        let mut probed = false;

        loop {
            tokio::select! {
                reason = &mut io => return session_end(reason),
                expiry = &mut watch => {
                    let reason = (&mut io).await;
                    return match expiry {
                        Some(Expiry::PingTimeout) => SessionEnd::Failed,
                        _ => session_end(reason),
                    };
                }
                expiry = &mut probe, if !probed => {
                    probed = true;
                    if expiry == Some(Expiry::UnknownToRelay) {
                        self.liveness.set_state(LinkState::Closing);
                        transport.close();
                        (&mut io).await;
                        return SessionEnd::Closed;
                    }
                }
            }
        }
    }

    async fn probe(&self) -> Option<Expiry> {
        tokio::time::sleep(liveness::PROBE_DELAY).await;
        match self.config.ping_url(&self.client_id) {
            Ok(url) => liveness::probe(&self.http, url).await,
            Err(_) => None,
        }
    }
}

fn session_end(reason: Disconnect) -> SessionEnd {
    match reason {
        Disconnect::Error => SessionEnd::Failed,
        Disconnect::Local | Disconnect::Peer => SessionEnd::Closed,
    }
}

fn to_tungstenite(msg: WireMessage) -> Message {
    match msg {
        WireMessage::Text(text) => Message::Text(text),
        WireMessage::Binary(data) => Message::Binary(data),
        WireMessage::Keepalive => Message::Ping(Vec::new()),
        WireMessage::Close => Message::Close(None),
    }
}

fn from_tungstenite(msg: Message) -> WireMessage {
    match msg {
        Message::Text(text) => WireMessage::Text(text),
        Message::Binary(data) => WireMessage::Binary(data),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => WireMessage::Keepalive,
        Message::Close(_) => WireMessage::Close,
    }
}
