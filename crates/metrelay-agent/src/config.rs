use std::time::Duration;

use metrelay_proto::DEFAULT_PROXY_PORT;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// A metrics endpoint exposed through the proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathEntry {
    /// Label used in logs.
    pub name: String,
    /// Path the proxy serves this endpoint under.
    pub path: String,
    /// Local URL scraped when the proxy asks for the path.
    pub url: String,
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Proxy address as `host[:port]`, scheme optional.
    pub proxy_addr: String,
    /// TLS server name, defaults to the proxy host.
    pub server_name: Option<String>,
    /// Name announced to the proxy during registration.
    pub agent_name: String,
    /// Hostname reported to the proxy.
    pub hostname: String,
    /// Pause between reconnect attempts.
    pub reconnect_pause_secs: u64,
    /// Whether the heartbeat prober runs while connected.
    pub heartbeat_enabled: bool,
    /// How often the prober checks for inactivity.
    pub heartbeat_check_pause_millis: u64,
    /// Quiet period after which a heartbeat is sent.
    pub heartbeat_max_inactivity_secs: u64,
    /// Capacity of the scrape response queue.
    pub scrape_response_queue_size: usize,
    /// How long the writer waits on an empty queue before
    /// re-checking for disconnect.
    pub scrape_response_queue_check_millis: u64,
    /// Upper bound on concurrently executing fetches.
    pub max_concurrent_fetches: usize,
    /// Endpoints registered after connecting.
    pub paths: Vec<PathEntry>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            proxy_addr: "localhost".to_string(),
            server_name: None,
            agent_name: String::new(),
            hostname: "localhost".to_string(),
            reconnect_pause_secs: 3,
            heartbeat_enabled: true,
            heartbeat_check_pause_millis: 500,
            heartbeat_max_inactivity_secs: 5,
            scrape_response_queue_size: 128,
            scrape_response_queue_check_millis: 500,
            max_concurrent_fetches: 8,
            paths: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.proxy_addr.trim().is_empty() {
            return Err(AgentError::InvalidConfig(
                "proxy address is required".to_string(),
            ));
        }
        parse_proxy_address(&self.proxy_addr)?;
        if self.agent_name.trim().is_empty() {
            return Err(AgentError::InvalidConfig(
                "agent name is required".to_string(),
            ));
        }
        if self.scrape_response_queue_size == 0 {
            return Err(AgentError::InvalidConfig(
                "scrape response queue size must be greater than zero".to_string(),
            ));
        }
        if self.scrape_response_queue_check_millis == 0 {
            return Err(AgentError::InvalidConfig(
                "scrape response queue check interval must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_enabled && self.heartbeat_check_pause_millis == 0 {
            return Err(AgentError::InvalidConfig(
                "heartbeat check interval must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(AgentError::InvalidConfig(
                "max concurrent fetches must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_pause(&self) -> Duration {
        Duration::from_secs(self.reconnect_pause_secs)
    }

    pub fn queue_check(&self) -> Duration {
        Duration::from_millis(self.scrape_response_queue_check_millis)
    }

    pub fn heartbeat_check_pause(&self) -> Duration {
        Duration::from_millis(self.heartbeat_check_pause_millis)
    }

    pub fn heartbeat_max_inactivity(&self) -> Duration {
        Duration::from_secs(self.heartbeat_max_inactivity_secs)
    }
}

/// Splits a proxy address into host and port, stripping an optional
/// `http://` or `https://` prefix. The port defaults to
/// [`DEFAULT_PROXY_PORT`] when absent.
pub fn parse_proxy_address(addr: &str) -> Result<(String, u16), AgentError> {
    let trimmed = addr.trim();
    let stripped = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let stripped = stripped.strip_suffix('/').unwrap_or(stripped);
    if stripped.is_empty() {
        return Err(AgentError::InvalidConfig(format!(
            "Invalid proxy address '{addr}'"
        )));
    }
    match stripped.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err(AgentError::InvalidConfig(format!(
                    "Invalid proxy address '{addr}'"
                )));
            }
            let port = port.parse::<u16>().map_err(|_| {
                AgentError::InvalidConfig(format!("Invalid proxy port in '{addr}'"))
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((stripped.to_string(), DEFAULT_PROXY_PORT)),
    }
}
