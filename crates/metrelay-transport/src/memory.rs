//! In-memory transport
//!
//! Channel-backed implementation of the transport traits, passing decoded
//! messages directly between the two halves of a connection pair. It stands in
//! for the wire when the agent and its peer live in the same process:
//! integration tests run a scripted proxy on one half, embedders can do the
//! same.

use crate::{
    TransportConnection, TransportConnector, TransportError, TransportListener, TransportResult,
    TransportStream,
};
use async_trait::async_trait;
use metrelay_proto::ProxyMessage;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

/// Per-stream message buffer; senders block when the peer is this far behind
const STREAM_BUFFER: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One half of an in-memory bidirectional stream
#[derive(Debug)]
pub struct MemoryStream {
    tx: Option<mpsc::Sender<ProxyMessage>>,
    rx: mpsc::Receiver<ProxyMessage>,
}

/// Create a connected stream pair without a surrounding connection
pub fn stream_pair() -> (MemoryStream, MemoryStream) {
    let (a_tx, b_rx) = mpsc::channel(STREAM_BUFFER);
    let (b_tx, a_rx) = mpsc::channel(STREAM_BUFFER);
    (
        MemoryStream {
            tx: Some(a_tx),
            rx: b_rx,
        },
        MemoryStream {
            tx: Some(b_tx),
            rx: a_rx,
        },
    )
}

#[async_trait]
impl TransportStream for MemoryStream {
    async fn send_message(&mut self, message: &ProxyMessage) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::StreamClosed)?;
        tx.send(message.clone())
            .await
            .map_err(|_| TransportError::StreamClosed)
    }

    async fn recv_message(&mut self) -> TransportResult<Option<ProxyMessage>> {
        // None once the peer dropped or closed its sending half
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.tx.take();
        Ok(())
    }
}

/// One half of an in-memory connection pair
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    peer_tx: Mutex<Option<mpsc::Sender<MemoryStream>>>,
    incoming: Mutex<mpsc::Receiver<MemoryStream>>,
    closed: Arc<AtomicBool>,
}

/// Create a connected pair; streams opened on one half arrive on the other
pub fn connection_pair() -> (MemoryConnection, MemoryConnection) {
    let (a_tx, b_incoming) = mpsc::channel(16);
    let (b_tx, a_incoming) = mpsc::channel(16);
    let closed = Arc::new(AtomicBool::new(false));

    (
        MemoryConnection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_tx: Mutex::new(Some(a_tx)),
            incoming: Mutex::new(a_incoming),
            closed: Arc::clone(&closed),
        },
        MemoryConnection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_tx: Mutex::new(Some(b_tx)),
            incoming: Mutex::new(b_incoming),
            closed,
        },
    )
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    type Stream = MemoryStream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionError(
                "connection closed".to_string(),
            ));
        }

        let tx = self.peer_tx.lock().await.clone().ok_or_else(|| {
            TransportError::ConnectionError("connection closed".to_string())
        })?;

        let (local, remote) = stream_pair();
        tx.send(remote)
            .await
            .map_err(|_| TransportError::ConnectionError("peer connection gone".to_string()))?;

        trace!(connection = %self.connection_id(), "opened in-memory stream");
        Ok(local)
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }

        let mut incoming = self.incoming.lock().await;
        // None once the peer half was closed or dropped
        Ok(incoming.recv().await)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.peer_tx.lock().await.take();
        trace!(connection = %self.connection_id(), "closed in-memory connection");
    }

    fn connection_id(&self) -> String {
        format!("mem-{}", self.id)
    }
}

/// Listener half of the in-memory transport
#[derive(Debug)]
pub struct MemoryListener {
    incoming: Mutex<mpsc::Receiver<(MemoryConnection, SocketAddr)>>,
    tx: mpsc::Sender<(MemoryConnection, SocketAddr)>,
    addr: SocketAddr,
}

impl MemoryListener {
    pub fn new() -> Self {
        let (tx, incoming) = mpsc::channel(16);
        Self {
            incoming: Mutex::new(incoming),
            tx,
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }

    /// A connector whose `connect` delivers the peer half to this listener
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            listener_tx: self.tx.clone(),
        }
    }
}

impl Default for MemoryListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportListener for MemoryListener {
    type Connection = MemoryConnection;

    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)> {
        let mut incoming = self.incoming.lock().await;
        incoming
            .recv()
            .await
            .ok_or_else(|| TransportError::ConnectionError("listener closed".to_string()))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.addr)
    }
}

/// Connector half of the in-memory transport
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    listener_tx: mpsc::Sender<(MemoryConnection, SocketAddr)>,
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(
        &self,
        _addr: SocketAddr,
        _server_name: &str,
    ) -> TransportResult<Self::Connection> {
        let (local, remote) = connection_pair();
        let remote_addr = SocketAddr::from(([127, 0, 0, 1], 0));

        self.listener_tx
            .send((remote, remote_addr))
            .await
            .map_err(|_| TransportError::ConnectionError("listener gone".to_string()))?;

        Ok(local)
    }
}
