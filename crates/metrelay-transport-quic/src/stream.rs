//! QUIC stream implementation

use async_trait::async_trait;
use bytes::BytesMut;
use metrelay_proto::{FrameCodec, ProxyMessage};
use metrelay_transport::{TransportError, TransportResult, TransportStream};
use quinn::{RecvStream, SendStream};
use tracing::trace;

/// QUIC stream wrapper carrying length-prefixed protocol frames
#[derive(Debug)]
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
    stream_id: u64,
    closed: bool,
    // Buffer accumulating received data for frame decoding
    recv_buffer: BytesMut,
}

impl QuicStream {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        let stream_id = send.id().index();
        Self {
            send,
            recv,
            stream_id,
            closed: false,
            recv_buffer: BytesMut::with_capacity(8192),
        }
    }
}

#[async_trait]
impl TransportStream for QuicStream {
    async fn send_message(&mut self, message: &ProxyMessage) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }

        let encoded = FrameCodec::encode(message)?;

        self.send
            .write_all(&encoded)
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        trace!(stream_id = self.stream_id, "sent frame");
        Ok(())
    }

    async fn recv_message(&mut self) -> TransportResult<Option<ProxyMessage>> {
        if self.closed {
            return Ok(None);
        }

        loop {
            // Try to decode a frame from the buffer before reading more
            match FrameCodec::decode(&mut self.recv_buffer)? {
                Some(msg) => {
                    trace!(stream_id = self.stream_id, "received frame");
                    return Ok(Some(msg));
                }
                None => match self.recv.read_chunk(8192, true).await {
                    Ok(Some(chunk)) => {
                        self.recv_buffer.extend_from_slice(&chunk.bytes);
                    }
                    Ok(None) => {
                        self.closed = true;
                        if self.recv_buffer.is_empty() {
                            return Ok(None);
                        } else {
                            return Err(TransportError::ConnectionError(
                                "Stream ended mid-frame".to_string(),
                            ));
                        }
                    }
                    Err(e) => {
                        self.closed = true;
                        return Err(TransportError::ConnectionError(e.to_string()));
                    }
                },
            }
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }

        self.send
            .finish()
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        self.closed = true;
        Ok(())
    }
}
