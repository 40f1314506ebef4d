//! In-process fake proxy and canned fetcher shared by the integration
//! tests. The proxy speaks the real wire protocol over the memory
//! transport and scripts its registration and heartbeat replies.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrelay_agent::{AgentConfig, AgentMetrics, FetchError, FetchedBody, PathEntry, ScrapeFetcher};
use metrelay_proto::{ProxyMessage, ScrapeRequest, ScrapeResponse};
use metrelay_transport::memory::{MemoryConnection, MemoryConnector, MemoryListener, MemoryStream};
use metrelay_transport::{TransportConnection, TransportListener, TransportStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

pub const NODE_URL: &str = "http://localhost:9100/metrics";

/// Config pointed at the in-memory proxy, with short intervals and the
/// heartbeat prober off so frame logs stay predictable.
pub fn agent_config(paths: Vec<PathEntry>) -> AgentConfig {
    AgentConfig {
        proxy_addr: "localhost:50051".to_string(),
        agent_name: "test-agent".to_string(),
        hostname: "testhost".to_string(),
        reconnect_pause_secs: 1,
        heartbeat_enabled: false,
        scrape_response_queue_check_millis: 100,
        paths,
        ..Default::default()
    }
}

pub fn node_path() -> PathEntry {
    PathEntry {
        name: "node".to_string(),
        path: "metrics".to_string(),
        url: NODE_URL.to_string(),
    }
}

/// Scripted proxy replies.
#[derive(Clone)]
pub struct ProxyBehavior {
    pub register_valid: bool,
    pub register_reason: String,
    pub heartbeat_valid: bool,
}

impl Default for ProxyBehavior {
    fn default() -> Self {
        Self {
            register_valid: true,
            register_reason: String::new(),
            heartbeat_valid: true,
        }
    }
}

/// A fake proxy listening on an in-memory transport.
pub struct FakeProxy {
    connections: mpsc::Receiver<ProxyConnection>,
}

impl FakeProxy {
    /// Starts the proxy and returns a connector that dials it.
    pub fn start(behavior: ProxyBehavior) -> (MemoryConnector, FakeProxy) {
        let listener = MemoryListener::new();
        let connector = listener.connector();
        let (conn_tx, conn_rx) = mpsc::channel(8);
        tokio::spawn(accept_loop(listener, behavior, conn_tx));
        (
            connector,
            FakeProxy {
                connections: conn_rx,
            },
        )
    }

    /// Waits for the agent's next connection.
    pub async fn next_connection(&mut self) -> ProxyConnection {
        timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for an agent connection")
            .expect("fake proxy stopped")
    }
}

/// One agent connection accepted by the fake proxy.
pub struct ProxyConnection {
    /// Pushes scrape requests to the agent once its request stream is
    /// up.
    pub requests: mpsc::Sender<ScrapeRequest>,
    /// Scrape responses written by the agent.
    pub responses: mpsc::Receiver<ScrapeResponse>,
    /// Every frame read from the agent, in arrival order per stream.
    pub frames: mpsc::UnboundedReceiver<ProxyMessage>,
    conn: Arc<MemoryConnection>,
    dying: watch::Sender<bool>,
}

impl ProxyConnection {
    /// Drops the connection the way a crashing proxy would. All stream
    /// tasks wind down so the agent sees its streams end.
    pub async fn close(&self) {
        self.dying.send_replace(true);
        self.conn.close().await;
    }

    /// Next frame the agent sent, panicking after a timeout.
    pub async fn next_frame(&mut self) -> ProxyMessage {
        timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for an agent frame")
            .expect("agent dropped the connection")
    }

    /// Reads frames until one matches.
    pub async fn wait_for_frame(
        &mut self,
        matches: impl Fn(&ProxyMessage) -> bool,
    ) -> ProxyMessage {
        loop {
            let frame = self.next_frame().await;
            if matches(&frame) {
                return frame;
            }
        }
    }

    /// Next scrape response the agent wrote.
    pub async fn next_response(&mut self) -> ScrapeResponse {
        timeout(WAIT, self.responses.recv())
            .await
            .expect("timed out waiting for a scrape response")
            .expect("agent dropped the connection")
    }

    /// Collects frames until the agent drops the connection.
    pub async fn frames_until_close(mut self) -> Vec<ProxyMessage> {
        let mut frames = Vec::new();
        loop {
            match timeout(WAIT, self.frames.recv()).await {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => return frames,
                Err(_) => panic!("timed out waiting for the agent to drop the connection"),
            }
        }
    }
}

async fn accept_loop(
    listener: MemoryListener,
    behavior: ProxyBehavior,
    conn_tx: mpsc::Sender<ProxyConnection>,
) {
    let mut agent_seq = 0usize;
    while let Ok((conn, _addr)) = listener.accept().await {
        agent_seq += 1;
        let conn = Arc::new(conn);
        let (requests_tx, requests_rx) = mpsc::channel(32);
        let (responses_tx, responses_rx) = mpsc::channel(32);
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let (dying_tx, dying_rx) = watch::channel(false);
        let accepted = ProxyConnection {
            requests: requests_tx,
            responses: responses_rx,
            frames: log_rx,
            conn: conn.clone(),
            dying: dying_tx,
        };
        if conn_tx.send(accepted).await.is_err() {
            return;
        }
        tokio::spawn(connection_loop(
            conn,
            behavior.clone(),
            agent_seq,
            requests_rx,
            responses_tx,
            log_tx,
            dying_rx,
        ));
    }
}

async fn connection_loop(
    conn: Arc<MemoryConnection>,
    behavior: ProxyBehavior,
    agent_seq: usize,
    requests: mpsc::Receiver<ScrapeRequest>,
    responses: mpsc::Sender<ScrapeResponse>,
    log: mpsc::UnboundedSender<ProxyMessage>,
    dying: watch::Receiver<bool>,
) {
    let requests = Arc::new(Mutex::new(Some(requests)));
    loop {
        match conn.accept_stream().await {
            Ok(Some(stream)) => {
                tokio::spawn(stream_loop(
                    stream,
                    behavior.clone(),
                    agent_seq,
                    requests.clone(),
                    responses.clone(),
                    log.clone(),
                    dying.clone(),
                ));
            }
            _ => return,
        }
    }
}

async fn stream_loop(
    mut stream: MemoryStream,
    behavior: ProxyBehavior,
    agent_seq: usize,
    requests: Arc<Mutex<Option<mpsc::Receiver<ScrapeRequest>>>>,
    responses: mpsc::Sender<ScrapeResponse>,
    log: mpsc::UnboundedSender<ProxyMessage>,
    mut dying: watch::Receiver<bool>,
) {
    let mut next_path_id = 0u64;
    let mut path_count = 0u64;
    loop {
        let message = tokio::select! {
            received = stream.recv_message() => match received {
                Ok(Some(message)) => message,
                _ => return,
            },
            _ = dying.wait_for(|dead| *dead) => return,
        };
        let _ = log.send(message.clone());
        let reply = match message {
            ProxyMessage::Connect => ProxyMessage::ConnectAck,
            ProxyMessage::RegisterAgent { .. } => ProxyMessage::RegisterAgentAck {
                valid: behavior.register_valid,
                reason: behavior.register_reason.clone(),
                agent_id: format!("agent-{agent_seq}"),
            },
            ProxyMessage::RegisterPath { .. } => {
                next_path_id += 1;
                path_count += 1;
                ProxyMessage::RegisterPathAck {
                    valid: true,
                    reason: String::new(),
                    path_id: next_path_id,
                }
            }
            ProxyMessage::UnregisterPath { .. } => {
                path_count = path_count.saturating_sub(1);
                ProxyMessage::UnregisterPathAck {
                    valid: true,
                    reason: String::new(),
                }
            }
            ProxyMessage::PathMapSize { .. } => ProxyMessage::PathMapSizeAck { path_count },
            ProxyMessage::Heartbeat { .. } => ProxyMessage::HeartbeatAck {
                valid: behavior.heartbeat_valid,
            },
            ProxyMessage::ReadRequests { .. } => {
                // This stream becomes the request stream: forward
                // test-pushed scrape requests until the test drops its
                // sender or the connection dies.
                let taken = requests.lock().await.take();
                if let Some(mut rx) = taken {
                    loop {
                        let request = tokio::select! {
                            pushed = rx.recv() => match pushed {
                                Some(request) => request,
                                None => return,
                            },
                            _ = dying.wait_for(|dead| *dead) => return,
                        };
                        if stream
                            .send_message(&ProxyMessage::ScrapeRequest(request))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                return;
            }
            ProxyMessage::WriteResponses { .. } => continue,
            ProxyMessage::ScrapeResponse(response) => {
                let _ = responses.send(response).await;
                continue;
            }
            _ => continue,
        };
        if stream.send_message(&reply).await.is_err() {
            return;
        }
    }
}

/// Fetcher returning canned bodies, recording how often it was called.
pub struct StaticFetcher {
    responses: HashMap<String, FetchedBody>,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self {
            responses: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, url: &str, status: u16, text: &str, content_type: &str) -> Self {
        self.responses.insert(
            url.to_string(),
            FetchedBody {
                status,
                text: text.to_string(),
                content_type: content_type.to_string(),
            },
        );
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScrapeFetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedBody, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses.get(url).cloned().ok_or(FetchError {
            kind: "connect error",
            message: "connection refused".to_string(),
        })
    }
}

/// Reads one counter value out of an agent's registry.
pub fn counter_value(metrics: &AgentMetrics, name: &str, label_value: &str) -> u64 {
    metrics
        .registry()
        .gather()
        .iter()
        .find(|family| family.get_name() == name)
        .map(|family| {
            family
                .get_metric()
                .iter()
                .filter(|m| m.get_label().iter().any(|l| l.get_value() == label_value))
                .map(|m| m.get_counter().get_value() as u64)
                .sum()
        })
        .unwrap_or(0)
}
