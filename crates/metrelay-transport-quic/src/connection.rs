//! QUIC connection implementation

use crate::stream::QuicStream;
use async_trait::async_trait;
use metrelay_transport::{TransportConnection, TransportError, TransportResult};
use quinn::ConnectionError;
use tracing::debug;

/// QUIC connection wrapper
#[derive(Debug)]
pub struct QuicConnection {
    connection: quinn::Connection,
}

impl QuicConnection {
    pub fn new(connection: quinn::Connection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl TransportConnection for QuicConnection {
    type Stream = QuicStream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        debug!(connection = %self.connection_id(), "opened QUIC stream");
        Ok(QuicStream::new(send, recv))
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        match self.connection.accept_bi().await {
            Ok((send, recv)) => {
                debug!(connection = %self.connection_id(), "accepted QUIC stream");
                Ok(Some(QuicStream::new(send, recv)))
            }
            // Orderly shutdown in either direction means no more streams
            Err(ConnectionError::ApplicationClosed(_))
            | Err(ConnectionError::ConnectionClosed(_))
            | Err(ConnectionError::LocallyClosed)
            | Err(ConnectionError::TimedOut)
            | Err(ConnectionError::Reset) => Ok(None),
            Err(e) => Err(TransportError::ConnectionError(e.to_string())),
        }
    }

    async fn close(&self) {
        self.connection.close(0u32.into(), b"closed");
        debug!(connection = %self.connection_id(), "closed QUIC connection");
    }

    fn connection_id(&self) -> String {
        format!("quic-{}", self.connection.stable_id())
    }
}
