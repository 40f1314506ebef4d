use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrelay_transport::{TransportConnection, TransportConnector, TransportError};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::config::{parse_proxy_address, AgentConfig};
use crate::error::AgentError;
use crate::fetch::{HttpFetcher, ScrapeFetcher};
use crate::limiter::ReconnectLimiter;
use crate::metrics::{AgentMetrics, CONNECT_ATTEMPT, CONNECT_FAILURE};
use crate::registry::PathRegistry;
use crate::rpc::{ControlClient, ControlSlot};
use crate::session::{self, SessionContext, SessionState};

/// Stream type produced by a connector's connections.
type ConnStream<C> = <<C as TransportConnector>::Connection as TransportConnection>::Stream;

/// An agent that connects out to a proxy, registers its metrics paths
/// and serves scrape requests until stopped. `run` reconnects forever,
/// rebuilding all per-session state on every attempt, so a crashed or
/// restarted proxy only costs one reconnect pause.
pub struct Agent<C: TransportConnector> {
    config: AgentConfig,
    proxy_host: String,
    proxy_port: u16,
    server_name: String,
    connector: C,
    fetcher: Arc<dyn ScrapeFetcher>,
    registry: Arc<PathRegistry>,
    metrics: Arc<AgentMetrics>,
    limiter: ReconnectLimiter,
    stopped: Arc<AtomicBool>,
    stop_watch: watch::Sender<bool>,
    running: AtomicBool,
    initial_connection: Arc<watch::Sender<bool>>,
    control: ControlSlot<ConnStream<C>>,
}

impl<C: TransportConnector> Agent<C> {
    /// Creates an agent that scrapes local endpoints over HTTP.
    pub fn new(config: AgentConfig, connector: C) -> Result<Self, AgentError> {
        let fetcher: Arc<dyn ScrapeFetcher> = Arc::new(HttpFetcher::new()?);
        Self::with_fetcher(config, connector, fetcher)
    }

    /// Creates an agent with a custom fetcher.
    pub fn with_fetcher(
        config: AgentConfig,
        connector: C,
        fetcher: Arc<dyn ScrapeFetcher>,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        let (proxy_host, proxy_port) = parse_proxy_address(&config.proxy_addr)?;
        let server_name = config
            .server_name
            .clone()
            .unwrap_or_else(|| proxy_host.clone());
        let limiter = ReconnectLimiter::new(config.reconnect_pause());
        let metrics = Arc::new(AgentMetrics::new()?);
        let (initial_connection, _) = watch::channel(false);
        let (stop_watch, _) = watch::channel(false);
        Ok(Self {
            config,
            proxy_host,
            proxy_port,
            server_name,
            connector,
            fetcher,
            registry: Arc::new(PathRegistry::new()),
            metrics,
            limiter,
            stopped: Arc::new(AtomicBool::new(false)),
            stop_watch,
            running: AtomicBool::new(false),
            initial_connection: Arc::new(initial_connection),
            control: Arc::new(Mutex::new(None)),
        })
    }

    /// Runs the reconnect loop until [`stop`](Self::stop) is called.
    /// Attempts are spaced at least the configured reconnect pause
    /// apart.
    pub async fn run(&self) -> Result<(), AgentError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(AgentError::AlreadyRunning);
        }
        info!(agent = %self.config.agent_name, proxy = %self.config.proxy_addr, "agent starting");
        // Prime the limiter so the first retry is paced like every
        // later one.
        self.limiter.acquire().await;
        while !self.is_stopped() {
            self.metrics.inc_connect(CONNECT_ATTEMPT);
            match self.run_attempt().await {
                Ok(()) => {
                    info!(proxy = %self.config.proxy_addr, "disconnected from proxy");
                }
                Err(e) if e.is_protocol_failure() => {
                    self.metrics.inc_connect(CONNECT_FAILURE);
                    info!(
                        proxy = %self.config.proxy_addr,
                        error = %e,
                        "disconnecting after invalid response from proxy"
                    );
                }
                Err(e) => {
                    self.metrics.inc_connect(CONNECT_FAILURE);
                    info!(proxy = %self.config.proxy_addr, error = %e, "disconnected from proxy");
                }
            }
            if self.is_stopped() {
                break;
            }
            let mut stop_rx = self.stop_watch.subscribe();
            tokio::select! {
                waited = self.limiter.acquire() => {
                    if !waited.is_zero() {
                        info!(waited_secs = waited.as_secs_f64(), "waited to reconnect");
                    }
                }
                _ = stop_rx.wait_for(|stopped| *stopped) => break,
            }
        }
        self.running.store(false, Ordering::Release);
        info!("agent stopped");
        Ok(())
    }

    async fn run_attempt(&self) -> Result<(), AgentError> {
        let addr = self.resolve_proxy().await?;
        self.registry.clear().await;
        self.metrics.reset_queue_size();
        let session = SessionState::new();
        let ctx = SessionContext {
            registry: self.registry.clone(),
            fetcher: self.fetcher.clone(),
            metrics: self.metrics.clone(),
            stopped: self.stopped.clone(),
            initial_connection: self.initial_connection.clone(),
            control_slot: self.control.clone(),
        };
        debug!(proxy = %self.config.proxy_addr, addr = %addr, "connecting to proxy");
        let conn = self.connector.connect(addr, &self.server_name).await?;
        let result = session::run(&conn, &self.config, &session, &ctx).await;
        session.set_disconnected();
        conn.close().await;
        *self.control.lock().await = None;
        result
    }

    async fn resolve_proxy(&self) -> Result<SocketAddr, AgentError> {
        let mut addrs = tokio::net::lookup_host((self.proxy_host.as_str(), self.proxy_port))
            .await
            .map_err(TransportError::IoError)?;
        addrs.next().ok_or_else(|| {
            AgentError::Transport(TransportError::ConnectionError(format!(
                "Could not resolve proxy host {}",
                self.proxy_host
            )))
        })
    }

    /// Signals the run loop to exit. The current session winds down
    /// within one queue check interval.
    pub fn stop(&self) {
        info!("stopping agent");
        self.stopped.store(true, Ordering::Release);
        self.stop_watch.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Waits until the agent has registered with the proxy at least
    /// once. Returns false when `wait` elapses first.
    pub async fn await_initial_connection(&self, wait: Duration) -> bool {
        let mut connected = self.initial_connection.subscribe();
        tokio::time::timeout(wait, connected.wait_for(|connected| *connected))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    /// Registers an extra path on the current session.
    pub async fn register_path(&self, path: &str, url: &str) -> Result<u64, AgentError> {
        let control = self.current_control().await?;
        self.registry.register(control.as_ref(), path, url).await
    }

    /// Unregisters a path from the current session.
    pub async fn unregister_path(&self, path: &str) -> Result<(), AgentError> {
        let control = self.current_control().await?;
        self.registry.unregister(control.as_ref(), path).await
    }

    /// Number of paths the proxy has mapped for this agent.
    pub async fn path_map_size(&self) -> Result<u64, AgentError> {
        let control = self.current_control().await?;
        self.registry.proxy_path_count(control.as_ref()).await
    }

    pub fn metrics(&self) -> &AgentMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    async fn current_control(&self) -> Result<Arc<ControlClient<ConnStream<C>>>, AgentError> {
        self.control
            .lock()
            .await
            .clone()
            .ok_or(AgentError::NotConnected)
    }
}
