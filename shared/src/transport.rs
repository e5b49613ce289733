//! Tunnel transport: one physical duplex connection carrying frames.
//!
//! The transport is socket-agnostic. Each side adapts its WebSocket type
//! into a `Sink`/`Stream` of [`WireMessage`] and hands both to
//! [`TransportIo::run`], which owns the single receive/send loop for the
//! connection. Everything else talks to the connection through a cloned
//! [`TunnelTransport`] handle.

use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::protocol::{Control, WireFrame};
use crate::{Error, Result};

/// Outbound queue depth per connection.
const OUTBOUND_QUEUE: usize = 256;

/// Transport-neutral view of one WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
    /// Protocol-level ping/pong; only counts as activity.
    Keepalive,
    Close,
}

/// Why [`TransportIo::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// [`TunnelTransport::close`] was called on this side.
    Local,
    /// The peer closed or the stream ended.
    Peer,
    /// Read or write failed.
    Error,
}

/// Last-activity stamp shared between the transport loop and liveness checks.
#[derive(Clone, Debug)]
pub struct Activity {
    epoch: Instant,
    last_ms: Arc<AtomicU64>,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn touch(&self) {
        #[allow(clippy::cast_possible_truncation)]
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Time since the last send or receive.
    pub fn idle(&self) -> Duration {
        #[allow(clippy::cast_possible_truncation)]
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now_ms.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives what arrives on a connection. Called from the receive loop, so
/// implementations must not block; long work is spawned.
pub trait FrameHandler: Send + Sync + 'static {
    type Inbound: WireFrame;

    fn on_frame(&self, frame: Self::Inbound);

    fn on_control(&self, _control: Control) {}

    /// The connection is gone. Called exactly once.
    fn on_close(&self) {}
}

/// Cloneable send half of a tunnel connection. `F` is the frame type this
/// side writes.
pub struct TunnelTransport<F> {
    outbound: mpsc::Sender<WireMessage>,
    activity: Activity,
    shutdown: Arc<watch::Sender<bool>>,
    _frame: PhantomData<fn(F)>,
}

impl<F> Clone for TunnelTransport<F> {
    fn clone(&self) -> Self {
        Self {
            outbound: self.outbound.clone(),
            activity: self.activity.clone(),
            shutdown: self.shutdown.clone(),
            _frame: PhantomData,
        }
    }
}

/// The receive half, consumed by [`TransportIo::run`].
pub struct TransportIo {
    outbound_tx: mpsc::Sender<WireMessage>,
    outbound_rx: mpsc::Receiver<WireMessage>,
    activity: Activity,
    shutdown: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<F: WireFrame> TunnelTransport<F> {
    pub fn new() -> (Self, TransportIo) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        let activity = Activity::new();
        activity.touch();

        let transport = Self {
            outbound: outbound_tx.clone(),
            activity: activity.clone(),
            shutdown: shutdown.clone(),
            _frame: PhantomData,
        };
        let io = TransportIo {
            outbound_tx,
            outbound_rx,
            activity,
            shutdown,
            shutdown_rx,
        };
        (transport, io)
    }

    /// Encode and queue a frame.
    pub async fn send(&self, frame: impl Into<F>) -> Result<()> {
        let bytes = frame.into().encode()?;
        self.outbound
            .send(WireMessage::Binary(bytes))
            .await
            .map_err(|_| Error::ConnectionLost)?;
        self.activity.touch();
        Ok(())
    }

    /// Queue a frame without waiting; used where awaiting is impossible
    /// (drop guards). Fails if the queue is full or the connection is gone.
    pub fn try_send(&self, frame: impl Into<F>) -> Result<()> {
        let bytes = frame.into().encode()?;
        self.outbound
            .try_send(WireMessage::Binary(bytes))
            .map_err(|_| Error::ConnectionLost)
    }

    pub async fn send_control(&self, control: Control) -> Result<()> {
        self.outbound
            .send(WireMessage::Text(control.as_str().to_string()))
            .await
            .map_err(|_| Error::ConnectionLost)?;
        self.activity.touch();
        Ok(())
    }

    /// Ask the receive loop to close the socket. Idempotent.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed() || *self.shutdown.borrow()
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }
}

impl TransportIo {
    /// Drive the connection until either side closes it. Inbound frames go
    /// to `handler`; `handler.on_close()` runs once on the way out.
    pub async fn run<Si, St, E, H>(mut self, sink: Si, stream: St, handler: Arc<H>) -> Disconnect
    where
        Si: Sink<WireMessage> + Send,
        Si::Error: Display + Send,
        St: Stream<Item = std::result::Result<WireMessage, E>> + Send,
        E: Display + Send,
        H: FrameHandler,
    {
        let mut sink = Box::pin(sink);
        let mut stream = Box::pin(stream);

        let reason = loop {
            tokio::select! {
                msg = stream.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            warn!("Tunnel socket error: {}", e);
                            break Disconnect::Error;
                        }
                        None => break Disconnect::Peer,
                    };
                    self.activity.touch();
                    match msg {
                        WireMessage::Binary(data) if data.is_empty() => {
                            handler.on_control(Control::Pong);
                        }
                        WireMessage::Binary(data) => {
                            if let Some(frame) = H::Inbound::decode(&data) {
                                handler.on_frame(frame);
                            }
                        }
                        WireMessage::Text(text) if text.is_empty() => {
                            handler.on_control(Control::Pong);
                        }
                        WireMessage::Text(text) => match Control::parse(&text) {
                            Some(Control::Ping) => {
                                let pong = WireMessage::Text(Control::Pong.as_str().to_string());
                                if self.outbound_tx.try_send(pong).is_err() {
                                    debug!("Outbound queue full, pong skipped");
                                }
                                handler.on_control(Control::Ping);
                            }
                            Some(control) => handler.on_control(control),
                            None => debug!("Ignoring text message outside the protocol"),
                        },
                        WireMessage::Keepalive => {}
                        WireMessage::Close => break Disconnect::Peer,
                    }
                }
                Some(msg) = self.outbound_rx.recv() => {
                    if let Err(e) = sink.send(msg).await {
                        warn!("Tunnel send failed: {}", e);
                        break Disconnect::Error;
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    let _ = sink.send(WireMessage::Close).await;
                    break Disconnect::Local;
                }
            }
        };

        self.shutdown.send_replace(true);
        let _ = sink.close().await;
        // Drop the queue so pending senders fail fast instead of waiting.
        self.outbound_rx.close();
        handler.on_close();
        reason
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod memory {
    //! In-memory socket pair for wiring both tunnel ends together in tests.

    use std::io;
    use std::pin::Pin;

    use futures_util::{Sink, Stream};
    use tokio::sync::mpsc;

    use super::WireMessage;

    pub type BoxSink = Pin<Box<dyn Sink<WireMessage, Error = io::Error> + Send>>;
    pub type BoxStream = Pin<Box<dyn Stream<Item = io::Result<WireMessage>> + Send>>;

    /// Two connected ends; what one end's sink accepts, the other's stream yields.
    pub fn link() -> ((BoxSink, BoxStream), (BoxSink, BoxStream)) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        ((sink(a_tx), stream(b_rx)), (sink(b_tx), stream(a_rx)))
    }

    fn sink(tx: mpsc::UnboundedSender<WireMessage>) -> BoxSink {
        Box::pin(futures_util::sink::unfold(tx, |tx, msg: WireMessage| async move {
            tx.send(msg)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))?;
            Ok::<_, io::Error>(tx)
        }))
    }

    fn stream(rx: mpsc::UnboundedReceiver<WireMessage>) -> BoxStream {
        Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (Ok(msg), rx))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BodyFrame, RequestFrame, ResponseFrame};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<RequestFrame>>,
        controls: Mutex<Vec<Control>>,
        closed: Mutex<u32>,
    }

    impl FrameHandler for Recorder {
        type Inbound = RequestFrame;

        fn on_frame(&self, frame: RequestFrame) {
            self.frames.lock().unwrap().push(frame);
        }

        fn on_control(&self, control: Control) {
            self.controls.lock().unwrap().push(control);
        }

        fn on_close(&self) {
            *self.closed.lock().unwrap() += 1;
        }
    }

    #[tokio::test]
    async fn test_frames_and_controls_dispatch() {
        let ((a_sink, a_stream), (mut b_sink, mut b_stream)) = memory::link();
        let (transport, io) = TunnelTransport::<ResponseFrame>::new();
        let recorder = Arc::new(Recorder::default());
        let task = tokio::spawn(io.run(a_sink, a_stream, recorder.clone()));

        let frame = RequestFrame::Body(BodyFrame::chunk("r1", b"abc".to_vec()));
        b_sink.send(WireMessage::Binary(frame.encode().unwrap())).await.unwrap();
        b_sink.send(WireMessage::Binary(b"garbage".to_vec())).await.unwrap();
        b_sink.send(WireMessage::Text("ping".into())).await.unwrap();

        // The ping is answered with a pong.
        assert_eq!(b_stream.next().await.unwrap().unwrap(), WireMessage::Text("pong".into()));

        transport.send(BodyFrame::end("r1")).await.unwrap();
        let WireMessage::Binary(bytes) = b_stream.next().await.unwrap().unwrap() else {
            panic!("expected a binary frame");
        };
        assert_eq!(ResponseFrame::try_decode(&bytes).unwrap(), ResponseFrame::Body(BodyFrame::end("r1")));

        transport.close();
        assert_eq!(b_stream.next().await.unwrap().unwrap(), WireMessage::Close);
        assert_eq!(task.await.unwrap(), Disconnect::Local);

        assert_eq!(recorder.frames.lock().unwrap().as_slice(), &[frame]);
        assert_eq!(recorder.controls.lock().unwrap().as_slice(), &[Control::Ping]);
        assert_eq!(*recorder.closed.lock().unwrap(), 1);
        assert!(transport.is_closed());
        assert!(transport.send(BodyFrame::end("r2")).await.is_err());
    }

    #[tokio::test]
    async fn test_peer_close_ends_loop() {
        let ((a_sink, a_stream), (b_sink, b_stream)) = memory::link();
        let (_transport, io) = TunnelTransport::<ResponseFrame>::new();
        let recorder = Arc::new(Recorder::default());
        let task = tokio::spawn(io.run(a_sink, a_stream, recorder.clone()));

        drop(b_sink);
        drop(b_stream);
        assert_eq!(task.await.unwrap(), Disconnect::Peer);
        assert_eq!(*recorder.closed.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_message_counts_as_pong() {
        let ((a_sink, a_stream), (mut b_sink, _b_stream)) = memory::link();
        let (transport, io) = TunnelTransport::<ResponseFrame>::new();
        let recorder = Arc::new(Recorder::default());
        let task = tokio::spawn(io.run(a_sink, a_stream, recorder.clone()));

        b_sink.send(WireMessage::Text(String::new())).await.unwrap();
        b_sink.send(WireMessage::Text("pong".into())).await.unwrap();
        b_sink.send(WireMessage::Close).await.unwrap();
        task.await.unwrap();

        assert_eq!(recorder.controls.lock().unwrap().as_slice(), &[Control::Pong, Control::Pong]);
        assert!(transport.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_idle() {
        let activity = Activity::new();
        activity.touch();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(activity.idle() >= Duration::from_secs(3));
        activity.touch();
        assert!(activity.idle() < Duration::from_secs(1));
    }
}
