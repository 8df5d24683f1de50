//! Per-socket reader/writer pumps.
//!
//! Each WebSocket gets a [`ConnectionHandle`] holding a bounded outbound
//! queue. The writer pump drains that queue onto the socket; the reader
//! pump decodes inbound frames and hands them to the router. Whichever
//! side stops first, the reader always unregisters the connection and
//! closes the queue before the task ends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::hub::Hub;

/// Process-unique identity of one live socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue is full")]
    Full,

    #[error("connection is closed")]
    Closed,
}

/// Shared handle to a live connection.
///
/// The registry, the router and both pumps hold clones of the same
/// `Arc<ConnectionHandle>`; the socket itself is owned by the pumps.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<String>,
    closed: watch::Sender<bool>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (outbound, queue) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        let handle = Arc::new(Self {
            id: ConnectionId::next(),
            outbound,
            closed,
        });
        (handle, queue)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueue an encoded frame without waiting.
    pub fn send(&self, frame: String) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Mark the connection closed. Returns `true` only for the first call.
    pub fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

/// Drive one upgraded WebSocket until either side gives up.
pub async fn serve_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (conn, queue) = hub.open_connection().await;
    let (sink, stream) = socket.split();

    let writer = tokio::spawn(write_pump(
        sink,
        queue,
        conn.clone(),
        hub.settings().write_timeout,
    ));

    read_pump(stream, &conn, &hub).await;

    hub.disconnect(conn.id()).await;
    conn.close();

    if let Err(e) = writer.await {
        warn!(conn = %conn.id(), error = %e, "Writer task panicked");
    }
    info!(conn = %conn.id(), "Connection closed");
}

async fn read_pump(mut stream: SplitStream<WebSocket>, conn: &Arc<ConnectionHandle>, hub: &Hub) {
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = conn.closed() => {
                debug!(conn = %conn.id(), "Connection closed by server");
                break;
            }
        };

        match frame {
            Some(Ok(Message::Text(text))) => hub.dispatch(conn, text.as_str()).await,
            Some(Ok(Message::Close(_))) | None => break,
            // Binary frames are not part of the protocol; pings are answered by axum.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(conn = %conn.id(), error = %e, "Socket read failed");
                break;
            }
        }
    }
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<String>,
    conn: Arc<ConnectionHandle>,
    write_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = conn.closed() => None,
            frame = queue.recv() => frame,
        };

        let Some(text) = frame else {
            let _ = tokio::time::timeout(write_timeout, sink.send(Message::Close(None))).await;
            break;
        };

        match tokio::time::timeout(write_timeout, sink.send(Message::Text(text.into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn = %conn.id(), error = %e, "Socket write failed");
                break;
            }
            Err(_) => {
                warn!(conn = %conn.id(), "Write deadline exceeded");
                break;
            }
        }
    }

    // Peer is gone; stop the reader too.
    conn.close();
}
