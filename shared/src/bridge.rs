//! WebSocket splice: joins two already-open WebSocket hops into one
//! transparent pipe. Messages are forwarded untouched in both directions.

use std::fmt::Display;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{timeout, Duration};
use tracing::debug;

/// How long the surviving direction gets to drain once the other one ends.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Pipe `a` and `b` into each other until either closes, then close the
/// other. Close races are swallowed.
pub async fn splice<A, B, M, EA, EB>(a: A, b: B)
where
    A: Stream<Item = Result<M, EA>> + Sink<M> + Send,
    B: Stream<Item = Result<M, EB>> + Sink<M> + Send,
    <A as Sink<M>>::Error: Display + Send,
    <B as Sink<M>>::Error: Display + Send,
    EA: Display + Send,
    EB: Display + Send,
    M: Send,
{
    let (a_tx, a_rx) = a.split();
    let (b_tx, b_rx) = b.split();

    let mut a_to_b = Box::pin(pipe("a->b", a_rx, b_tx));
    let mut b_to_a = Box::pin(pipe("b->a", b_rx, a_tx));

    tokio::select! {
        _ = &mut a_to_b => {
            let _ = timeout(CLOSE_GRACE, b_to_a).await;
        }
        _ = &mut b_to_a => {
            let _ = timeout(CLOSE_GRACE, a_to_b).await;
        }
    }
}

async fn pipe<S, K, M, E>(direction: &'static str, mut from: S, mut to: K)
where
    S: Stream<Item = Result<M, E>> + Unpin,
    K: Sink<M> + Unpin,
    K::Error: Display,
    E: Display,
{
    let mut forwarded = 0u64;
    while let Some(msg) = from.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!(direction, "Hop read ended: {}", e);
                break;
            }
        };
        if let Err(e) = to.send(msg).await {
            debug!(direction, "Hop write ended: {}", e);
            break;
        }
        forwarded += 1;
    }
    if let Err(e) = to.close().await {
        debug!(direction, "Close on finished hop ignored: {}", e);
    }
    debug!(direction, forwarded, "Splice direction done");
}
