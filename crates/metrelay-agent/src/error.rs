use metrelay_proto::ProxyMessage;
use metrelay_transport::TransportError;
use thiserror::Error;

/// Errors produced by the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Agent registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Path registration failed for {path}: {reason}")]
    PathRegistrationFailed { path: String, reason: String },

    #[error("Path unregistration failed for {path}: {reason}")]
    PathUnregistrationFailed { path: String, reason: String },

    #[error("Unexpected message from proxy: {0}")]
    UnexpectedMessage(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not connected to a proxy")]
    NotConnected,

    #[error("Agent is already running")]
    AlreadyRunning,

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl AgentError {
    /// True when the proxy answered but refused us, as opposed to the
    /// connection itself failing.
    pub fn is_protocol_failure(&self) -> bool {
        matches!(
            self,
            AgentError::RegistrationFailed(_)
                | AgentError::PathRegistrationFailed { .. }
                | AgentError::PathUnregistrationFailed { .. }
                | AgentError::UnexpectedMessage(_)
        )
    }

    pub(crate) fn unexpected(message: &ProxyMessage) -> Self {
        AgentError::UnexpectedMessage(format!("{message:?}"))
    }
}
