//! Metrelay Agent - Fleet metrics agent CLI
//!
//! This binary runs the metrelay agent, which connects out to a metrelay
//! proxy and serves scrape requests for metrics endpoints in its network.

use anyhow::{Context, Result};
use clap::Parser;
use metrelay_agent::{Agent, AgentConfig, PathEntry};
use metrelay_transport_quic::{QuicConfig, QuicConnector};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Metrelay agent - serves metrics endpoints through a metrelay proxy
#[derive(Parser, Debug)]
#[command(name = "metrelay-agent")]
#[command(about = "Metrelay agent - serves metrics endpoints through a metrelay proxy")]
#[command(version)]
#[command(long_about = r#"
Metrelay Agent connects to a metrelay proxy and answers scrape requests
by fetching metrics endpoints in its own network, so the endpoints never
need to be reachable from outside.

EXAMPLES:
  # Start agent with paths from a config file
  metrelay-agent --config agent-config.yaml

  # Override proxy address and agent name
  metrelay-agent --config agent-config.yaml \
    --proxy proxy.example.com:50051 \
    --name web-1

  # Start agent with custom log level
  metrelay-agent --config agent-config.yaml --log-level debug

ENVIRONMENT VARIABLES:
  METRELAY_PROXY       Proxy address (host[:port])
  METRELAY_AGENT_NAME  Agent name announced to the proxy
"#)]
struct Args {
    /// Proxy address (host[:port], scheme optional)
    #[arg(long, env = "METRELAY_PROXY")]
    proxy: Option<String>,

    /// Agent name announced to the proxy
    #[arg(long, env = "METRELAY_AGENT_NAME")]
    name: Option<String>,

    /// TLS server name, defaults to the proxy host
    #[arg(long)]
    server_name: Option<String>,

    /// Extra CA certificate (PEM) trusted for the proxy connection
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,
}

/// Configuration file format
#[derive(Debug, Serialize, Deserialize)]
struct ConfigFile {
    /// Proxy connection configuration
    proxy: ProxyConfigFile,

    /// Agent identity
    #[serde(default)]
    agent: AgentConfigFile,

    /// Pause between reconnect attempts in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    reconnect_pause_secs: Option<u64>,

    /// Heartbeat tuning
    #[serde(default)]
    heartbeat: HeartbeatConfigFile,

    /// Scrape response queue tuning
    #[serde(default)]
    scrape_queue: QueueConfigFile,

    /// Maximum concurrent fetches
    #[serde(skip_serializing_if = "Option::is_none")]
    max_concurrent_fetches: Option<usize>,

    /// Metrics endpoints served through the proxy
    #[serde(default)]
    paths: Vec<PathEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProxyConfigFile {
    /// Proxy address (host[:port], scheme optional)
    address: String,

    /// TLS server name override
    #[serde(skip_serializing_if = "Option::is_none")]
    server_name: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AgentConfigFile {
    /// Agent name announced to the proxy
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HeartbeatConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    check_pause_millis: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    max_inactivity_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    check_millis: Option<u64>,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Copy the values a config file provides onto the defaults
fn apply_config_file(config: &mut AgentConfig, file: ConfigFile) {
    config.proxy_addr = file.proxy.address;
    config.server_name = file.proxy.server_name;
    if let Some(name) = file.agent.name {
        config.agent_name = name;
    }
    if let Some(pause) = file.reconnect_pause_secs {
        config.reconnect_pause_secs = pause;
    }
    if let Some(enabled) = file.heartbeat.enabled {
        config.heartbeat_enabled = enabled;
    }
    if let Some(check) = file.heartbeat.check_pause_millis {
        config.heartbeat_check_pause_millis = check;
    }
    if let Some(max) = file.heartbeat.max_inactivity_secs {
        config.heartbeat_max_inactivity_secs = max;
    }
    if let Some(size) = file.scrape_queue.size {
        config.scrape_response_queue_size = size;
    }
    if let Some(check) = file.scrape_queue.check_millis {
        config.scrape_response_queue_check_millis = check;
    }
    if let Some(max) = file.max_concurrent_fetches {
        config.max_concurrent_fetches = max;
    }
    config.paths = file.paths;
}

/// Merge CLI args with config file, giving precedence to CLI args
fn build_agent_config(args: &Args) -> Result<AgentConfig> {
    let mut config = AgentConfig {
        proxy_addr: String::new(),
        ..Default::default()
    };

    if let Some(config_path) = &args.config {
        info!("Loading configuration from: {}", config_path.display());
        let file = load_config_file(config_path)?;
        apply_config_file(&mut config, file);
    }

    // CLI args override config file
    if let Some(proxy) = &args.proxy {
        config.proxy_addr = proxy.clone();
    }
    if let Some(name) = &args.name {
        config.agent_name = name.clone();
    }
    if let Some(server_name) = &args.server_name {
        config.server_name = Some(server_name.clone());
    }

    if config.proxy_addr.is_empty() {
        anyhow::bail!("Proxy address is required (use --proxy or config file)");
    }
    if config.agent_name.is_empty() {
        anyhow::bail!("Agent name is required (use --name or config file)");
    }

    config.hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    config.validate()?;

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Setup logging first
    setup_logging(&args.log_level)?;

    info!("Metrelay Agent starting...");

    // Build agent configuration
    let config = build_agent_config(&args).context("Failed to build agent configuration")?;

    info!("Agent name: {}", config.agent_name);
    info!("Proxy: {}", config.proxy_addr);
    info!("Paths: {}", config.paths.len());

    // Build the QUIC connector
    let mut quic_config = if args.insecure {
        info!("TLS certificate verification disabled");
        QuicConfig::client_insecure()
    } else {
        QuicConfig::client_default()
    };
    if let Some(ca_cert) = &args.ca_cert {
        quic_config = quic_config.with_ca_cert(ca_cert.clone());
    }
    let connector =
        QuicConnector::new(Arc::new(quic_config)).context("Failed to create QUIC connector")?;

    // Create and start the agent
    let agent = Arc::new(Agent::new(config, connector).context("Failed to create agent")?);

    info!("Starting agent...");

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    // Start the agent
    let runner = agent.clone();
    let mut agent_task = tokio::spawn(async move { runner.run().await });

    // Wait for Ctrl+C or agent exit
    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            agent.stop();
            match tokio::time::timeout(Duration::from_secs(10), &mut agent_task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => error!("Agent error: {:#}", e),
                Ok(Err(e)) => error!("Agent task panicked: {}", e),
                Err(_) => error!("Agent did not stop in time"),
            }
        }
        result = &mut agent_task => {
            match result {
                Ok(Ok(())) => {
                    info!("Agent stopped normally");
                }
                Ok(Err(e)) => {
                    error!("Agent error: {:#}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Agent task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    info!("Agent stopped");
    Ok(())
}
