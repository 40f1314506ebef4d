//! Metrelay Agent - Outbound metrics agent for scraping endpoints behind a firewall
//!
//! The agent dials out to a metrelay proxy, registers the metrics paths
//! it serves and then answers scrape requests by fetching local HTTP
//! endpoints and streaming the bodies back to the proxy.
//!
//! # Features
//!
//! - **Outbound Only**: the agent connects to the proxy, never the
//!   other way around, so it works behind NAT and firewalls
//! - **Path Registration**: each agent serves any number of named
//!   metrics paths, registered per session and adjustable at runtime
//! - **Bounded Scraping**: concurrent fetches are capped and responses
//!   flow through a bounded queue that applies backpressure
//! - **Heartbeats**: an idle prober keeps quiet sessions alive and
//!   detects proxies that silently forgot us
//! - **Automatic Reconnect**: the run loop reconnects forever with a
//!   paced backoff, rebuilding all session state on every attempt
//! - **Metrics**: every agent keeps its own prometheus registry of
//!   scrape and connection counters
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use metrelay_agent::{Agent, AgentConfig, PathEntry};
//! use metrelay_transport_quic::{QuicConfig, QuicConnector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentConfig {
//!         proxy_addr: "proxy.example.com:50051".to_string(),
//!         agent_name: "web-1".to_string(),
//!         paths: vec![PathEntry {
//!             name: "node".to_string(),
//!             path: "node_metrics".to_string(),
//!             url: "http://localhost:9100/metrics".to_string(),
//!         }],
//!         ..Default::default()
//!     };
//!
//!     let connector = QuicConnector::new(Arc::new(QuicConfig::client_default()))?;
//!     let agent = Agent::new(config, connector)?;
//!     agent.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! Each connection attempt runs the same sequence:
//!
//! 1. **Connect**: open a transport connection and the control stream
//! 2. **Register**: announce the agent, receive its proxy-assigned id
//! 3. **Paths**: register every configured metrics path
//! 4. **Stream**: open the request and response streams and serve
//!    scrapes until the session dies
//! 5. **Reset**: throw the session away and start over after a pause

mod agent;
mod config;
mod dispatch;
mod error;
mod fetch;
mod heartbeat;
mod limiter;
mod metrics;
mod registry;
mod rpc;
mod session;

// Re-export public API
pub use agent::Agent;
pub use config::{parse_proxy_address, AgentConfig, PathEntry};
pub use error::AgentError;
pub use fetch::{FetchError, FetchedBody, HttpFetcher, ScrapeFetcher};
pub use metrics::AgentMetrics;
pub use registry::{PathContext, PathRegistry};
