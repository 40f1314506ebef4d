//! QUIC transport configuration

use crate::ALPN_METRELAY;
use metrelay_transport::{TransportError, TransportResult};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Client-side QUIC configuration
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Keep-alive interval
    pub keep_alive_interval: Duration,

    /// Maximum idle timeout; dead connections surface within this window
    pub max_idle_timeout: Duration,

    /// ALPN protocols offered during the handshake
    pub alpn_protocols: Vec<String>,

    /// Whether to verify the proxy's TLS certificate
    pub verify_server_cert: bool,

    /// Extra CA certificates (PEM) trusted in addition to the webpki roots
    pub ca_cert_path: Option<PathBuf>,
}

impl QuicConfig {
    /// Client configuration with defaults
    ///
    /// Verifies the proxy certificate against the webpki root store. For
    /// development against self-signed proxies use `client_insecure()` or
    /// `with_ca_cert()`.
    pub fn client_default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(3),
            max_idle_timeout: Duration::from_secs(10),
            alpn_protocols: vec![ALPN_METRELAY.to_string()],
            verify_server_cert: true,
            ca_cert_path: None,
        }
    }

    /// Client configuration that skips certificate verification
    ///
    /// **INSECURE**: only for local development against self-signed proxies.
    pub fn client_insecure() -> Self {
        Self {
            verify_server_cert: false,
            ..Self::client_default()
        }
    }

    /// Set custom keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set custom idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    /// Trust an additional CA certificate (PEM file)
    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.as_secs() == 0 {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval must be > 0".to_string(),
            ));
        }

        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(TransportError::ConfigurationError(
                "Idle timeout must be at least 2x keep-alive interval".to_string(),
            ));
        }

        Ok(())
    }

    /// Build quinn ClientConfig
    pub(crate) fn build_client_config(&self) -> TransportResult<quinn::ClientConfig> {
        // Use quinn's re-exported rustls
        let mut roots = quinn::rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(ca_path) = &self.ca_cert_path {
            for cert in load_certs(ca_path)? {
                roots.add(cert).map_err(|e| {
                    TransportError::ConfigurationError(format!("Invalid CA cert: {}", e))
                })?;
            }
        }

        let mut client_crypto = if self.verify_server_cert {
            quinn::rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            quinn::rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        client_crypto.alpn_protocols = self
            .alpn_protocols
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect();

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(self.max_idle_timeout.try_into().map_err(|_| {
            TransportError::ConfigurationError("Idle timeout out of range".to_string())
        })?));

        client_config.transport_config(Arc::new(transport));

        Ok(client_config)
    }
}

fn load_certs(
    path: &Path,
) -> TransportResult<Vec<quinn::rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))
}

// Certificate verifier that skips verification (INSECURE - only for development!)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl quinn::rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &quinn::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[quinn::rustls::pki_types::CertificateDer<'_>],
        _server_name: &quinn::rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: quinn::rustls::pki_types::UnixTime,
    ) -> Result<quinn::rustls::client::danger::ServerCertVerified, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &quinn::rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &quinn::rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<quinn::rustls::SignatureScheme> {
        use quinn::rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
