//! Protocol message types

use serde::{Deserialize, Serialize};

/// Main agent/proxy protocol message enum
///
/// The control stream carries the request/ack pairs; `ScrapeRequest` frames
/// flow proxy→agent on the request stream and `ScrapeResponse` frames
/// agent→proxy on the response stream. `reason` fields are empty strings on
/// success.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ProxyMessage {
    // Control stream: connection handshake
    Connect,
    ConnectAck,

    /// Agent announces itself; `agent_id` is empty, the proxy assigns one
    RegisterAgent {
        agent_id: String,
        agent_name: String,
        hostname: String,
    },
    RegisterAgentAck {
        valid: bool,
        reason: String,
        agent_id: String,
    },

    /// Register a scrape path under the agent's identity
    RegisterPath {
        agent_id: String,
        path: String,
    },
    RegisterPathAck {
        valid: bool,
        reason: String,
        path_id: u64,
    },

    UnregisterPath {
        agent_id: String,
        path: String,
    },
    UnregisterPathAck {
        valid: bool,
        reason: String,
    },

    /// Ask the proxy how many paths it holds for this agent
    PathMapSize {
        agent_id: String,
    },
    PathMapSizeAck {
        path_count: u64,
    },

    /// Liveness probe; an invalid ack means the proxy dropped this identity
    Heartbeat {
        agent_id: String,
    },
    HeartbeatAck {
        valid: bool,
    },

    // Stream headers
    /// Opens the proxy→agent scrape request stream
    ReadRequests {
        agent_id: String,
    },
    /// Opens the agent→proxy scrape response stream
    WriteResponses {
        agent_id: String,
    },

    // Streaming payloads
    ScrapeRequest(ScrapeRequest),
    ScrapeResponse(ScrapeResponse),

    /// Terminal ack after the response stream is half-closed
    WriteResponsesAck,
}

/// One unit of fetch work handed to the agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapeRequest {
    pub agent_id: String,
    pub scrape_id: u64,
    pub path: String,
}

/// Result of one fetch, correlated by `scrape_id`
///
/// `valid = false` always carries a human-readable `reason` and empty
/// `text`/`content_type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapeResponse {
    pub agent_id: String,
    pub scrape_id: u64,
    pub valid: bool,
    pub status_code: u16,
    pub reason: String,
    pub text: String,
    pub content_type: String,
}
