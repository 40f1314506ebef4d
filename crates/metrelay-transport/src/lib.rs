//! Transport abstraction layer for agent/proxy connections
//!
//! This crate provides transport-agnostic traits so the agent core can run
//! over different underlying protocols (QUIC in production, the in-memory
//! transport in tests and embedded setups) without coupling to any specific
//! implementation.
//!
//! A connection carries multiple bidirectional message streams; the agent
//! opens one control stream for request/reply calls plus one stream per
//! traffic direction.

use async_trait::async_trait;
use metrelay_proto::{CodecError, ProxyMessage};
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;

pub mod memory;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Codec error: {0}")]
    CodecError(#[from] CodecError),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional message stream over a transport connection
#[async_trait]
pub trait TransportStream: Send + Sync + Debug {
    /// Send a protocol message on this stream
    async fn send_message(&mut self, message: &ProxyMessage) -> TransportResult<()>;

    /// Receive a protocol message from this stream
    ///
    /// Returns `None` if the stream has been closed gracefully by the remote peer.
    async fn recv_message(&mut self) -> TransportResult<Option<ProxyMessage>>;

    /// Close the sending side of the stream
    async fn close(&mut self) -> TransportResult<()>;
}

/// A transport connection that can create multiple streams
#[async_trait]
pub trait TransportConnection: Send + Sync + Debug {
    /// The stream type created by this connection
    type Stream: TransportStream + 'static;

    /// Open a new bidirectional stream
    async fn open_stream(&self) -> TransportResult<Self::Stream>;

    /// Accept an incoming bidirectional stream
    ///
    /// Returns `None` when the connection is closed and no more streams will arrive.
    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>>;

    /// Close the connection
    async fn close(&self);

    /// Get a stable identifier for this connection, for logging and correlation
    fn connection_id(&self) -> String;
}

/// Server-side: listens for incoming transport connections
///
/// The agent never listens; this exists so tests and embedders can host the
/// proxy end of a connection.
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    /// The connection type accepted by this listener
    type Connection: TransportConnection;

    /// Accept an incoming connection
    ///
    /// Returns the connection and the remote address of the connecting peer.
    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)>;

    /// Get the local address this listener is bound to
    fn local_addr(&self) -> TransportResult<SocketAddr>;
}

/// Client-side: establishes outgoing transport connections
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    /// The connection type created by this connector
    type Connection: TransportConnection;

    /// Connect to a remote server
    ///
    /// `server_name` is the name used for TLS verification; transports without
    /// TLS ignore it.
    async fn connect(&self, addr: SocketAddr, server_name: &str)
        -> TransportResult<Self::Connection>;
}
