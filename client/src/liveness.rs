//! Connection liveness: idle pings, the pong deadline, the relay-side health
//! probe and the reconnect policy that follows a session's end.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use backhaul_shared::{Control, TunnelTransport, WireFrame};
use reqwest::Url;
use serde::Deserialize;
use tokio::sync::Notify;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const PONG_TIMEOUT: Duration = Duration::from_secs(5);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const RETRY_DELAY: Duration = Duration::from_secs(5);
/// The relay registers a connection only after the handshake completes.
pub const PROBE_DELAY: Duration = Duration::from_secs(2);

/// How often idleness is checked.
const CHECK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Open,
    PingPending,
    Closing,
}

/// Why a watched connection was given up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// No pong within [`PONG_TIMEOUT`].
    PingTimeout,
    /// The relay has no record of this connection.
    UnknownToRelay,
}

/// How one connect attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The socket never opened.
    ConnectFailed,
    /// The relay refused the connection token.
    Unauthorized,
    /// The socket was open and then failed or went silent.
    Failed,
    /// The socket was open and closed cleanly.
    Closed,
}

/// Delay before the next attempt; `None` stops reconnecting.
pub fn reconnect_delay(end: SessionEnd) -> Option<Duration> {
    match end {
        SessionEnd::ConnectFailed | SessionEnd::Failed => Some(RETRY_DELAY),
        SessionEnd::Closed => Some(Duration::ZERO),
        SessionEnd::Unauthorized => None,
    }
}

struct Inner {
    state: Mutex<LinkState>,
    ping_pending: AtomicBool,
    pong: Notify,
}

/// Liveness state of one agent connection. Cloned into the frame handler,
/// which reports pongs, and driven by [`Liveness::watch`].
#[derive(Clone)]
pub struct Liveness {
    inner: Arc<Inner>,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LinkState::Disconnected),
                ping_pending: AtomicBool::new(false),
                pong: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> LinkState {
        match self.inner.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_state(&self, next: LinkState) {
        let mut state = match self.inner.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state != next {
            debug!(from = ?*state, to = ?next, "Link state");
            *state = next;
        }
    }

    /// A pong (or an empty message) arrived. Returns whether it answered an
    /// outstanding ping.
    pub fn on_pong(&self) -> bool {
        if self.inner.ping_pending.swap(false, Ordering::AcqRel) {
            self.inner.pong.notify_one();
            true
        } else {
            false
        }
    }

    /// Ping whenever `transport` has been idle for `idle`, until a ping goes
    /// unanswered. Closes the transport before returning. Also returns, with
    /// nothing to report, once the transport closes by other means.
    pub async fn watch<F: WireFrame>(
        &self,
        transport: &TunnelTransport<F>,
        idle: Duration,
    ) -> Option<Expiry> {
        let mut ticks = time::interval(CHECK_PERIOD.min(idle));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticks.tick().await;
            if transport.is_closed() {
                return None;
            }
            if transport.activity().idle() < idle {
                continue;
            }

            self.inner.ping_pending.store(true, Ordering::Release);
            self.set_state(LinkState::PingPending);
            if transport.send_control(Control::Ping).await.is_err() {
                return None;
            }
            debug!("Idle, ping sent");

            match time::timeout(PONG_TIMEOUT, self.inner.pong.notified()).await {
                Ok(()) => self.set_state(LinkState::Open),
                Err(_) => {
                    self.inner.ping_pending.store(false, Ordering::Release);
                    warn!("No pong within {}s, closing the connection", PONG_TIMEOUT.as_secs());
                    self.set_state(LinkState::Closing);
                    transport.close();
                    return Some(Expiry::PingTimeout);
                }
            }
        }
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct PingReply {
    #[allow(dead_code)]
    ok: bool,
    code: u16,
    #[serde(default)]
    message: String,
}

/// Ask the relay whether it still knows this connection. Only a definite
/// 404 answer counts; unreachable or malformed replies are ignored.
pub async fn probe(http: &reqwest::Client, url: Url) -> Option<Expiry> {
    let reply = http.get(url).timeout(PROBE_TIMEOUT).send().await;
    let reply: PingReply = match reply {
        Ok(resp) => match resp.json().await {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Health probe reply unreadable: {}", e);
                return None;
            }
        },
        Err(e) => {
            debug!("Health probe failed: {}", e);
            return None;
        }
    };
    if reply.code == 404 {
        info!("Relay does not know this connection ({}), reconnecting", reply.message);
        return Some(Expiry::UnknownToRelay);
    }
    None
}
