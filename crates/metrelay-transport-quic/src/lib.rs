//! QUIC transport for metrelay agents
//!
//! Client-side implementation of the `metrelay-transport` traits over quinn.
//! The agent dials the proxy with TLS verification against the webpki roots
//! (optionally extended by a custom CA, or skipped entirely for local
//! development) and multiplexes its control and scrape streams over one QUIC
//! connection. The proxy end of the wire lives elsewhere; this crate ships no
//! listener.

pub mod config;
pub mod connection;
pub mod connector;
pub mod stream;

pub use config::QuicConfig;
pub use connection::QuicConnection;
pub use connector::QuicConnector;
pub use stream::QuicStream;

/// ALPN protocol identifier spoken on agent/proxy connections
pub const ALPN_METRELAY: &str = "metrelay-v1";
