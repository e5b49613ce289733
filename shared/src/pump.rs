//! Stream pump: moves a chunked body between a local byte stream and a
//! sequence of `Body` frames for one request id.

use std::fmt::Display;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{BodyFrame, WireFrame};
use crate::transport::TunnelTransport;
use crate::Result;

pub type Chunk = std::result::Result<Bytes, io::Error>;

/// Bytes an inbound body may hold that its local reader has not taken yet.
pub const MAX_BUFFERED_BODY: usize = 32 * 1024 * 1024;

/// Local end of an inbound body. `Send + Sync`, so it can back both an
/// axum response body and a reqwest request body.
#[derive(Debug)]
pub struct BodyStream {
    rx: mpsc::UnboundedReceiver<Chunk>,
    buffered: Arc<AtomicUsize>,
}

impl Stream for BodyStream {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Chunk>> {
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(Some(Ok(chunk))) = &polled {
            self.buffered.fetch_sub(chunk.len(), Ordering::AcqRel);
        }
        polled
    }
}

/// Read `body` to the end, emitting one `Body` frame per non-empty chunk and a
/// terminal frame without payload. A source that fails mid-transfer ends the
/// stream cleanly. Errors only when the connection itself is gone.
pub async fn pump_out<F, S, B, E>(
    transport: &TunnelTransport<F>,
    request_id: &str,
    body: S,
) -> Result<()>
where
    F: WireFrame + From<BodyFrame>,
    S: Stream<Item = std::result::Result<B, E>>,
    B: Into<Bytes>,
    E: Display,
{
    let mut body = Box::pin(body);
    let mut chunks = 0usize;
    loop {
        match body.next().await {
            Some(Ok(chunk)) => {
                let chunk: Bytes = chunk.into();
                if chunk.is_empty() {
                    continue;
                }
                chunks += 1;
                transport
                    .send(BodyFrame::chunk(request_id, chunk.to_vec()))
                    .await?;
            }
            Some(Err(e)) => {
                warn!(request_id, "Body source failed after {} chunks: {}", chunks, e);
                break;
            }
            None => break,
        }
    }
    debug!(request_id, chunks, "Body pumped");
    transport.send(BodyFrame::end(request_id)).await
}

/// Write side of an inbound body: frames in, chunks out.
#[derive(Debug)]
pub struct BodySink {
    tx: mpsc::UnboundedSender<Chunk>,
    buffered: Arc<AtomicUsize>,
    limit: usize,
}

/// What a [`BodySink::write`] left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Written {
    /// More frames are expected.
    More,
    /// The frame ended the body; drop the sink to end the local stream.
    Finished,
    /// The reader is too far behind. The chunk was not queued and the
    /// exchange should be aborted.
    Overflow,
}

/// A sink and the stream it feeds, capped at [`MAX_BUFFERED_BODY`].
pub fn body_channel() -> (BodySink, BodyStream) {
    body_channel_with_limit(MAX_BUFFERED_BODY)
}

pub fn body_channel_with_limit(limit: usize) -> (BodySink, BodyStream) {
    let (tx, rx) = mpsc::unbounded_channel::<Chunk>();
    let buffered = Arc::new(AtomicUsize::new(0));
    (
        BodySink {
            tx,
            buffered: buffered.clone(),
            limit,
        },
        BodyStream { rx, buffered },
    )
}

impl BodySink {
    /// Apply one frame.
    pub fn write(&self, frame: BodyFrame) -> Written {
        if let Some(data) = frame.data {
            if !data.is_empty() {
                let len = data.len();
                let held = self.buffered.fetch_add(len, Ordering::AcqRel) + len;
                if held > self.limit {
                    self.buffered.fetch_sub(len, Ordering::AcqRel);
                    warn!(request_id = %frame.request_id, held, "Body reader fell behind, giving up");
                    return Written::Overflow;
                }
                if self.tx.send(Ok(Bytes::from(data))).is_err() {
                    self.buffered.fetch_sub(len, Ordering::AcqRel);
                    debug!(request_id = %frame.request_id, "Body reader went away");
                }
            }
        }
        if frame.eof {
            Written::Finished
        } else {
            Written::More
        }
    }

    /// End the local stream with an error instead of a clean finish.
    pub fn fail(self, reason: &str) {
        let _ = self
            .tx
            .send(Err(io::Error::new(io::ErrorKind::ConnectionAborted, reason.to_string())));
    }

    /// The local reader dropped its end.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
