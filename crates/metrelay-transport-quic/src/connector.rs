//! QUIC connector for establishing proxy connections

use crate::config::QuicConfig;
use crate::connection::QuicConnection;
use async_trait::async_trait;
use metrelay_transport::{TransportConnector, TransportError, TransportResult};
use quinn::Endpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// QUIC connector; one endpoint reused across all connection attempts
#[derive(Debug)]
pub struct QuicConnector {
    endpoint: Endpoint,
    _config: Arc<QuicConfig>,
}

impl QuicConnector {
    pub fn new(config: Arc<QuicConfig>) -> TransportResult<Self> {
        config.validate()?;

        let client_config = config.build_client_config()?;

        let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))
            .map_err(TransportError::IoError)?;
        endpoint.set_default_client_config(client_config);

        debug!("QUIC connector created");

        Ok(Self {
            endpoint,
            _config: config,
        })
    }
}

#[async_trait]
impl TransportConnector for QuicConnector {
    type Connection = QuicConnection;

    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<Self::Connection> {
        debug!("Connecting to QUIC proxy: {} ({})", server_name, addr);

        let connecting = self
            .endpoint
            .connect(addr, server_name)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        let connection = connecting
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        info!("QUIC connection established to {} ({})", server_name, addr);

        Ok(QuicConnection::new(connection))
    }
}
