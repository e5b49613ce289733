//! Request multiplexing over agent connections.
//!
//! Every public request becomes one exchange: a fresh request id, a header
//! frame, optional body frames, and a one-shot slot the agent's response
//! resolves. Exchanges live in the [`Exchanges`] table of the connection they
//! were sent on, so losing a connection fails exactly its own requests.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocket;
use backhaul_shared::headers;
use backhaul_shared::protocol::{base32_id, AGENT_FAILURE_HEADER};
use backhaul_shared::pump::{self, BodySink, BodyStream, Written};
use backhaul_shared::{
    AbortFrame, BodyFrame, Error, FrameHandler, HeaderList, RequestFrame, RequestHeader,
    ResponseFrame, ResponseHeader, Result, TunnelTransport,
};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::Stream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Response header plus its streaming body, as handed back to the caller.
pub struct ProxiedResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderList,
    /// `None` when the header already carried end-of-stream.
    pub body: Option<BodyStream>,
}

impl ProxiedResponse {
    /// A 502 the agent made up, as opposed to one the origin sent.
    fn is_agent_failure(&self) -> bool {
        self.status == 502
            && self.body.is_none()
            && headers::get(&self.headers, AGENT_FAILURE_HEADER).is_some()
    }
}

/// How an exchange was resolved.
pub enum Outcome {
    Response(ProxiedResponse),
    /// The agent dialed back a dedicated hop for a WebSocket upgrade.
    WebSocket {
        socket: WebSocket,
        /// Sub-protocol the origin accepted, if any.
        protocol: Option<String>,
    },
}

/// In-flight exchanges of one agent connection.
pub struct Exchanges {
    transport: TunnelTransport<RequestFrame>,
    pending: DashMap<String, oneshot::Sender<Outcome>>,
    /// Response bodies still streaming in.
    bodies: DashMap<String, BodySink>,
    body_limit: usize,
}

impl Exchanges {
    pub fn new(transport: TunnelTransport<RequestFrame>) -> Self {
        Self {
            transport,
            pending: DashMap::new(),
            bodies: DashMap::new(),
            body_limit: pump::MAX_BUFFERED_BODY,
        }
    }

    /// Cap on response bytes held for a caller that reads slower than the
    /// agent sends.
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    pub fn transport(&self) -> &TunnelTransport<RequestFrame> {
        &self.transport
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Exchanges still awaiting a header or streaming a body.
    pub fn in_flight(&self) -> usize {
        self.pending.len() + self.bodies.len()
    }

    /// Hand `outcome` to whoever waits on `request_id`. Gives it back when
    /// nobody does.
    pub fn resolve(&self, request_id: &str, outcome: Outcome) -> std::result::Result<(), Outcome> {
        match self.pending.remove(request_id) {
            Some((_, tx)) => tx.send(outcome),
            None => Err(outcome),
        }
    }

    fn open(&self, request_id: &str) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.to_string(), tx);
        rx
    }

    fn forget(&self, request_id: &str) -> bool {
        self.pending.remove(request_id).is_some()
    }

    /// Stop the agent working on `request_id`. A body still streaming to
    /// the caller ends with an error.
    fn abort(&self, request_id: &str) {
        if let Some((_, sink)) = self.bodies.remove(request_id) {
            sink.fail("exchange aborted");
        }
        if self.transport.try_send(AbortFrame::new(request_id)).is_err() {
            debug!(request_id, "Abort not delivered, connection busy or gone");
        }
    }

    fn on_header(&self, header: ResponseHeader) {
        let request_id = header.request_id;
        let Some((_, tx)) = self.pending.remove(&request_id) else {
            warn!(request_id = %request_id, "Response arrived for timed-out request (dropped)");
            return;
        };

        let body = if header.eof {
            None
        } else {
            let (sink, stream) = pump::body_channel_with_limit(self.body_limit);
            self.bodies.insert(request_id.clone(), sink);
            Some(stream)
        };
        let streaming = body.is_some();
        let outcome = Outcome::Response(ProxiedResponse {
            status: header.status,
            status_text: header.status_text,
            headers: header.headers,
            body,
        });
        if tx.send(outcome).is_err() && streaming {
            self.abort(&request_id);
        }
    }

    fn on_body(&self, frame: BodyFrame) {
        let request_id = frame.request_id.clone();
        let written = match self.bodies.get(&request_id) {
            Some(sink) if sink.is_closed() => None,
            Some(sink) => Some(sink.write(frame)),
            None => {
                debug!(request_id = %request_id, "Body frame without a live exchange (dropped)");
                return;
            }
        };
        match written {
            Some(Written::Finished) => {
                self.bodies.remove(&request_id);
            }
            Some(Written::More) => {}
            Some(Written::Overflow) => self.abort(&request_id),
            None => {
                debug!(request_id = %request_id, "Caller stopped reading, aborting");
                self.abort(&request_id);
            }
        }
    }
}

impl FrameHandler for Exchanges {
    type Inbound = ResponseFrame;

    fn on_frame(&self, frame: ResponseFrame) {
        match frame {
            ResponseFrame::Header(header) => self.on_header(header),
            ResponseFrame::Body(body) => self.on_body(body),
        }
    }

    fn on_close(&self) {
        let waiting = self.pending.len();
        // Dropping the senders wakes every waiter with a receive error.
        self.pending.clear();

        let streaming: Vec<String> = self.bodies.iter().map(|e| e.key().clone()).collect();
        for request_id in &streaming {
            if let Some((_, sink)) = self.bodies.remove(request_id) {
                sink.fail("agent connection lost");
            }
        }
        if waiting + streaming.len() > 0 {
            warn!(
                waiting,
                streaming = streaming.len(),
                "Agent connection lost with exchanges in flight"
            );
        }
    }
}

/// Issues request ids and runs exchanges to completion.
pub struct Multiplexer {
    next_id: AtomicU64,
    timeout: Duration,
}

impl Multiplexer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    pub fn next_request_id(&self) -> String {
        base32_id(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Send one request over `exchanges`' connection and wait for its
    /// response header. The request body, if any, streams in the background
    /// and keeps going after the response starts.
    pub async fn dispatch<S, B, E>(
        &self,
        exchanges: &Arc<Exchanges>,
        method: String,
        path: String,
        headers: HeaderList,
        body: Option<S>,
    ) -> Result<Outcome>
    where
        S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
        B: Into<Bytes> + Send + 'static,
        E: Display + Send + 'static,
    {
        let request_id = self.next_request_id();
        let rx = exchanges.open(&request_id);
        let mut guard = ExchangeGuard {
            exchanges: exchanges.clone(),
            request_id: request_id.clone(),
            pump: None,
            armed: true,
        };

        debug!(request_id = %request_id, method = %method, path = %path, "Dispatching");
        let header = RequestHeader {
            request_id: request_id.clone(),
            method,
            path,
            headers,
            eof: body.is_none(),
        };
        if let Err(e) = exchanges.transport.send(RequestFrame::Header(header)).await {
            guard.armed = false;
            exchanges.forget(&request_id);
            return Err(e);
        }

        if let Some(body) = body {
            let transport = exchanges.transport.clone();
            let id = request_id.clone();
            guard.pump = Some(tokio::spawn(async move {
                if let Err(e) = pump::pump_out(&transport, &id, body).await {
                    debug!(request_id = %id, "Request body cut short: {}", e);
                }
            }));
        }

        let result = match timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => {
                exchanges.forget(&request_id);
                // An upload still in progress is cancelled on the agent too.
                if let Some(pump) = guard.pump.take().filter(|p| !p.is_finished()) {
                    pump.abort();
                    exchanges.abort(&request_id);
                }
                warn!(request_id = %request_id, "No response within {:?}", self.timeout);
                Err(Error::GatewayTimeout)
            }
        };
        guard.armed = false;

        match result {
            Ok(Outcome::Response(response)) if response.is_agent_failure() => Err(
                Error::BadGateway("agent could not reach the local service".to_string()),
            ),
            other => other,
        }
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

/// Cleans up after a caller that stopped waiting before its exchange
/// resolved.
struct ExchangeGuard {
    exchanges: Arc<Exchanges>,
    request_id: String,
    pump: Option<JoinHandle<()>>,
    armed: bool,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if self.exchanges.forget(&self.request_id) {
            debug!(request_id = %self.request_id, "Caller went away");
            self.exchanges.abort(&self.request_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_shared::transport::memory;
    use backhaul_shared::{WireFrame, WireMessage};
    use futures_util::{stream, SinkExt, StreamExt};

    type NoBody = stream::Iter<std::vec::IntoIter<std::io::Result<Bytes>>>;

    fn connect() -> (Arc<Exchanges>, memory::BoxSink, memory::BoxStream) {
        let ((a_sink, a_stream), (b_sink, b_stream)) = memory::link();
        let (transport, io) = TunnelTransport::<RequestFrame>::new();
        let exchanges = Arc::new(Exchanges::new(transport));
        tokio::spawn(io.run(a_sink, a_stream, exchanges.clone()));
        (exchanges, b_sink, b_stream)
    }

    async fn next_request(rx: &mut memory::BoxStream) -> RequestFrame {
        loop {
            match rx.next().await {
                Some(Ok(WireMessage::Binary(bytes))) => {
                    return RequestFrame::try_decode(&bytes).unwrap()
                }
                Some(Ok(_)) => continue,
                other => panic!("agent side ended: {:?}", other.map(|r| r.is_ok())),
            }
        }
    }

    fn reply(frame: ResponseFrame) -> WireMessage {
        WireMessage::Binary(frame.encode().unwrap())
    }

    fn ok_header(request_id: &str, eof: bool) -> ResponseFrame {
        ResponseFrame::Header(ResponseHeader {
            request_id: request_id.to_string(),
            status: 200,
            status_text: "OK".into(),
            headers: vec![("content-type".into(), "text/plain".into())],
            eof,
        })
    }

    async fn read_body(body: BodyStream) -> Vec<u8> {
        body.map(|chunk| chunk.unwrap().to_vec()).concat().await
    }

    #[tokio::test]
    async fn test_get_streams_response_body() {
        let (exchanges, mut agent_tx, mut agent_rx) = connect();
        let mux = Multiplexer::default();

        let agent = tokio::spawn(async move {
            let RequestFrame::Header(header) = next_request(&mut agent_rx).await else {
                panic!("expected header");
            };
            assert_eq!(header.method, "GET");
            assert_eq!(header.path, "/x");
            assert!(header.eof);
            let id = header.request_id;
            agent_tx.send(reply(ok_header(&id, false))).await.unwrap();
            agent_tx.send(reply(BodyFrame::chunk(&id, b"hi".to_vec()).into())).await.unwrap();
            agent_tx.send(reply(BodyFrame::end(&id).into())).await.unwrap();
            (agent_tx, agent_rx)
        });

        let outcome = mux
            .dispatch(&exchanges, "GET".into(), "/x".into(), Vec::new(), None::<NoBody>)
            .await
            .unwrap();
        let Outcome::Response(response) = outcome else {
            panic!("expected an HTTP response");
        };
        assert_eq!(response.status, 200);
        assert_eq!(response.status_text, "OK");
        assert_eq!(read_body(response.body.unwrap()).await, b"hi");
        let _ends = agent.await.unwrap();
        assert_eq!(exchanges.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_request_body_streams_to_agent() {
        let (exchanges, mut agent_tx, mut agent_rx) = connect();
        let mux = Multiplexer::default();

        let agent = tokio::spawn(async move {
            let RequestFrame::Header(header) = next_request(&mut agent_rx).await else {
                panic!("expected header");
            };
            assert!(!header.eof);
            let mut body = Vec::new();
            loop {
                let RequestFrame::Body(frame) = next_request(&mut agent_rx).await else {
                    panic!("expected body frame");
                };
                if let Some(data) = frame.data {
                    body.extend_from_slice(&data);
                }
                if frame.eof {
                    break;
                }
            }
            agent_tx.send(reply(ok_header(&header.request_id, true))).await.unwrap();
            (body, agent_tx)
        });

        let chunks: Vec<std::io::Result<Bytes>> =
            vec![Ok(Bytes::from_static(b"a=1")), Ok(Bytes::from_static(b"&b=2"))];
        let outcome = mux
            .dispatch(&exchanges, "POST".into(), "/form".into(), Vec::new(), Some(stream::iter(chunks)))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Response(ProxiedResponse { status: 200, body: None, .. })));
        let (body, _agent_tx) = agent.await.unwrap();
        assert_eq!(body, b"a=1&b=2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_response_is_dropped() {
        let (exchanges, mut agent_tx, mut agent_rx) = connect();
        let mux = Multiplexer::new(Duration::from_secs(30));

        let result = mux
            .dispatch(&exchanges, "GET".into(), "/slow".into(), Vec::new(), None::<NoBody>)
            .await;
        assert!(matches!(result, Err(Error::GatewayTimeout)));
        assert_eq!(exchanges.in_flight(), 0);

        let RequestFrame::Header(header) = next_request(&mut agent_rx).await else {
            panic!("expected header");
        };
        agent_tx.send(reply(ok_header(&header.request_id, false))).await.unwrap();
        agent_tx.send(reply(BodyFrame::end(&header.request_id).into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(exchanges.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_sequential_requests_leave_nothing_behind() {
        let (exchanges, mut agent_tx, mut agent_rx) = connect();
        let mux = Multiplexer::default();

        tokio::spawn(async move {
            loop {
                let RequestFrame::Header(header) = next_request(&mut agent_rx).await else {
                    continue;
                };
                let frame = ResponseFrame::Header(ResponseHeader {
                    request_id: header.request_id,
                    status: 204,
                    status_text: "No Content".into(),
                    headers: Vec::new(),
                    eof: true,
                });
                if agent_tx.send(reply(frame)).await.is_err() {
                    break;
                }
            }
        });

        for n in 0..1000 {
            let outcome = mux
                .dispatch(&exchanges, "GET".into(), format!("/item/{}", n), Vec::new(), None::<NoBody>)
                .await
                .unwrap();
            assert!(matches!(outcome, Outcome::Response(ProxiedResponse { status: 204, .. })));
        }
        assert_eq!(exchanges.in_flight(), 0);
        assert_eq!(mux.next_request_id(), base32_id(1001));
    }

    #[tokio::test]
    async fn test_connection_loss_fails_only_its_own_exchanges() {
        let (lost, lost_tx, mut lost_rx) = connect();
        let (alive, mut alive_tx, mut alive_rx) = connect();
        let mux = Arc::new(Multiplexer::default());

        let doomed = {
            let mux = mux.clone();
            let lost = lost.clone();
            tokio::spawn(async move {
                mux.dispatch(&lost, "GET".into(), "/a".into(), Vec::new(), None::<NoBody>).await
            })
        };
        let survivor = {
            let mux = mux.clone();
            let alive = alive.clone();
            tokio::spawn(async move {
                mux.dispatch(&alive, "GET".into(), "/b".into(), Vec::new(), None::<NoBody>).await
            })
        };

        next_request(&mut lost_rx).await;
        let RequestFrame::Header(header) = next_request(&mut alive_rx).await else {
            panic!("expected header");
        };

        drop(lost_tx);
        drop(lost_rx);
        assert!(matches!(doomed.await.unwrap(), Err(Error::ConnectionLost)));
        assert_eq!(lost.in_flight(), 0);

        alive_tx.send(reply(ok_header(&header.request_id, true))).await.unwrap();
        assert!(matches!(survivor.await.unwrap(), Ok(Outcome::Response(_))));
    }

    #[tokio::test]
    async fn test_streaming_body_fails_on_connection_loss() {
        let (exchanges, mut agent_tx, mut agent_rx) = connect();
        let mux = Multiplexer::default();

        let agent = tokio::spawn(async move {
            let RequestFrame::Header(header) = next_request(&mut agent_rx).await else {
                panic!("expected header");
            };
            let id = header.request_id;
            agent_tx.send(reply(ok_header(&id, false))).await.unwrap();
            agent_tx.send(reply(BodyFrame::chunk(&id, b"part".to_vec()).into())).await.unwrap();
            (agent_tx, agent_rx)
        });

        let Outcome::Response(response) = mux
            .dispatch(&exchanges, "GET".into(), "/big".into(), Vec::new(), None::<NoBody>)
            .await
            .unwrap()
        else {
            panic!("expected an HTTP response");
        };
        let mut body = response.body.unwrap();
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"part"));

        drop(agent.await.unwrap());
        assert!(body.next().await.unwrap().is_err());
        assert_eq!(exchanges.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_slow_caller_overflow_aborts_exchange() {
        let ((a_sink, a_stream), (mut agent_tx, mut agent_rx)) = memory::link();
        let (transport, io) = TunnelTransport::<RequestFrame>::new();
        let exchanges = Arc::new(Exchanges::new(transport).with_body_limit(8));
        tokio::spawn(io.run(a_sink, a_stream, exchanges.clone()));
        let mux = Multiplexer::default();

        let pending = {
            let exchanges = exchanges.clone();
            tokio::spawn(async move {
                mux.dispatch(&exchanges, "GET".into(), "/big".into(), Vec::new(), None::<NoBody>)
                    .await
            })
        };
        let RequestFrame::Header(header) = next_request(&mut agent_rx).await else {
            panic!("expected header");
        };
        let id = header.request_id;
        agent_tx.send(reply(ok_header(&id, false))).await.unwrap();
        let Ok(Outcome::Response(response)) = pending.await.unwrap() else {
            panic!("expected an HTTP response");
        };

        // Nobody reads while the agent keeps sending.
        agent_tx.send(reply(BodyFrame::chunk(&id, b"12345".to_vec()).into())).await.unwrap();
        agent_tx.send(reply(BodyFrame::chunk(&id, b"6789".to_vec()).into())).await.unwrap();

        assert_eq!(next_request(&mut agent_rx).await, RequestFrame::Abort(AbortFrame::new(&id)));
        assert_eq!(exchanges.in_flight(), 0);

        let mut body = response.body.unwrap();
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"12345"));
        assert!(body.next().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_agent_failure_maps_to_bad_gateway() {
        let (exchanges, mut agent_tx, mut agent_rx) = connect();
        let mux = Multiplexer::default();

        tokio::spawn(async move {
            let RequestFrame::Header(header) = next_request(&mut agent_rx).await else {
                panic!("expected header");
            };
            let failure = ResponseFrame::Header(ResponseHeader::bad_gateway(header.request_id));
            agent_tx.send(reply(failure)).await.unwrap();
            agent_rx
        });

        let result = mux
            .dispatch(&exchanges, "GET".into(), "/".into(), Vec::new(), None::<NoBody>)
            .await;
        assert!(matches!(result, Err(Error::BadGateway(_))));
    }

    #[tokio::test]
    async fn test_origin_bad_gateway_passes_through() {
        let (exchanges, mut agent_tx, mut agent_rx) = connect();
        let mux = Multiplexer::default();

        tokio::spawn(async move {
            let RequestFrame::Header(header) = next_request(&mut agent_rx).await else {
                panic!("expected header");
            };
            let bare = ResponseFrame::Header(ResponseHeader {
                request_id: header.request_id,
                status: 502,
                status_text: "Bad Gateway".into(),
                headers: Vec::new(),
                eof: true,
            });
            agent_tx.send(reply(bare)).await.unwrap();
            agent_rx
        });

        let outcome = mux
            .dispatch(&exchanges, "GET".into(), "/".into(), Vec::new(), None::<NoBody>)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Response(ProxiedResponse { status: 502, body: None, .. })));
    }

    #[tokio::test]
    async fn test_abandoned_exchange_sends_abort() {
        let (exchanges, _agent_tx, mut agent_rx) = connect();
        let mux = Arc::new(Multiplexer::default());

        let caller = {
            let mux = mux.clone();
            let exchanges = exchanges.clone();
            tokio::spawn(async move {
                mux.dispatch(&exchanges, "GET".into(), "/stuck".into(), Vec::new(), None::<NoBody>)
                    .await
            })
        };
        let RequestFrame::Header(header) = next_request(&mut agent_rx).await else {
            panic!("expected header");
        };
        caller.abort();
        let _ = caller.await;

        assert_eq!(
            next_request(&mut agent_rx).await,
            RequestFrame::Abort(AbortFrame::new(&header.request_id))
        );
        assert!(!exchanges.is_pending(&header.request_id));
    }
}
