use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrelay_proto::ProxyMessage;
use metrelay_transport::{TransportConnection, TransportStream};
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::AgentConfig;
use crate::dispatch::{self, ResponseDrain, ScrapeDispatcher};
use crate::error::AgentError;
use crate::fetch::ScrapeFetcher;
use crate::heartbeat;
use crate::metrics::{AgentMetrics, CONNECT_SUCCESS};
use crate::registry::PathRegistry;
use crate::rpc::{self, ControlClient, ControlSlot};

/// State shared by the tasks of a single proxy session. A fresh value
/// is created for every connection attempt, so nothing leaks from one
/// session into the next.
pub(crate) struct SessionState {
    started: Instant,
    identity: RwLock<Option<String>>,
    last_activity_millis: AtomicU64,
    disconnected: AtomicBool,
}

impl SessionState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            identity: RwLock::new(None),
            last_activity_millis: AtomicU64::new(0),
            disconnected: AtomicBool::new(false),
        })
    }

    /// Agent id assigned by the proxy, once registered.
    pub async fn identity(&self) -> Option<String> {
        self.identity.read().await.clone()
    }

    pub async fn set_identity(&self, agent_id: &str) {
        *self.identity.write().await = Some(agent_id.to_string());
    }

    /// Records outbound traffic, deferring the next heartbeat.
    pub fn mark_activity(&self) {
        self.last_activity_millis
            .store(self.clock_millis(), Ordering::Release);
    }

    /// Time since the last recorded activity. Starts counting at
    /// session creation, so an idle session heartbeats only after a
    /// full quiet period.
    pub fn idle_time(&self) -> Duration {
        let idle = self
            .clock_millis()
            .saturating_sub(self.last_activity_millis.load(Ordering::Acquire));
        Duration::from_millis(idle)
    }

    pub fn set_disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    fn clock_millis(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Long-lived agent pieces a session borrows for one attempt.
pub(crate) struct SessionContext<S: TransportStream> {
    pub registry: Arc<PathRegistry>,
    pub fetcher: Arc<dyn ScrapeFetcher>,
    pub metrics: Arc<AgentMetrics>,
    pub stopped: Arc<AtomicBool>,
    pub initial_connection: Arc<watch::Sender<bool>>,
    pub control_slot: ControlSlot<S>,
}

/// Drives one proxy session over an established connection: control
/// handshake, path registration, then the streaming phase. Returns when
/// the session ends for any reason.
pub(crate) async fn run<C>(
    conn: &C,
    config: &AgentConfig,
    session: &Arc<SessionState>,
    ctx: &SessionContext<C::Stream>,
) -> Result<(), AgentError>
where
    C: TransportConnection,
{
    let control_stream = conn.open_stream().await?;
    let control = Arc::new(ControlClient::new(control_stream, session.clone()));

    match control.call(ProxyMessage::Connect).await? {
        ProxyMessage::ConnectAck => {}
        other => return Err(AgentError::unexpected(&other)),
    }
    debug!(connection = %conn.connection_id(), "connected to proxy");

    let register = ProxyMessage::RegisterAgent {
        agent_id: String::new(),
        agent_name: config.agent_name.clone(),
        hostname: config.hostname.clone(),
    };
    match control.call(register).await? {
        ProxyMessage::RegisterAgentAck {
            valid: true,
            agent_id,
            ..
        } => {
            session.set_identity(&agent_id).await;
            // Publish the control client before signalling, so callers
            // woken by await_initial_connection can issue path calls.
            *ctx.control_slot.lock().await = Some(control.clone());
            ctx.metrics.inc_connect(CONNECT_SUCCESS);
            ctx.initial_connection.send_replace(true);
            info!(agent = %config.agent_name, agent_id = %agent_id, "registered with proxy");
        }
        ProxyMessage::RegisterAgentAck {
            valid: false,
            reason,
            ..
        } => {
            return Err(AgentError::RegistrationFailed(reason));
        }
        other => return Err(AgentError::unexpected(&other)),
    }

    for entry in &config.paths {
        let path_id = ctx
            .registry
            .register(control.as_ref(), &entry.path, &entry.url)
            .await?;
        debug!(name = %entry.name, path = %entry.path, path_id, "registered path");
    }

    let mut request_stream = conn.open_stream().await?;
    let mut header = ProxyMessage::ReadRequests {
        agent_id: String::new(),
    };
    rpc::stamp_identity(&mut header, session.identity().await.as_deref());
    request_stream.send_message(&header).await?;

    let mut response_stream = conn.open_stream().await?;
    let mut header = ProxyMessage::WriteResponses {
        agent_id: String::new(),
    };
    rpc::stamp_identity(&mut header, session.identity().await.as_deref());
    response_stream.send_message(&header).await?;

    let (queue, drain) = dispatch::response_queue(config.scrape_response_queue_size);
    let dispatcher = Arc::new(ScrapeDispatcher::new(
        ctx.registry.clone(),
        ctx.fetcher.clone(),
        queue,
        ctx.metrics.clone(),
        config.max_concurrent_fetches,
    ));

    let _read_task = tokio::spawn(read_requests(request_stream, dispatcher, session.clone()));
    let _heartbeat_task = if config.heartbeat_enabled {
        Some(tokio::spawn(heartbeat::run(
            control.clone(),
            session.clone(),
            ctx.stopped.clone(),
            config.heartbeat_check_pause(),
            config.heartbeat_max_inactivity(),
        )))
    } else {
        None
    };

    info!(connection = %conn.connection_id(), "serving scrape requests");
    write_responses(
        response_stream,
        drain,
        session.clone(),
        ctx.stopped.clone(),
        ctx.metrics.clone(),
        config.queue_check(),
    )
    .await;
    Ok(())
}

/// Inbound pump: reads scrape requests off the request stream and hands
/// them to the dispatcher. Marks the session disconnected when the
/// stream ends.
pub(crate) async fn read_requests<S: TransportStream>(
    mut stream: S,
    dispatcher: Arc<ScrapeDispatcher>,
    session: Arc<SessionState>,
) {
    loop {
        match stream.recv_message().await {
            Ok(Some(ProxyMessage::ScrapeRequest(request))) => {
                trace!(scrape_id = request.scrape_id, path = %request.path, "scrape request");
                dispatcher.dispatch(request);
            }
            Ok(Some(other)) => {
                warn!(message = ?other, "unexpected message on request stream");
            }
            Ok(None) => {
                info!("request stream closed by proxy");
                session.set_disconnected();
                return;
            }
            Err(e) => {
                info!(error = %e, "request stream failed");
                session.set_disconnected();
                return;
            }
        }
    }
}

/// Outbound pump: drains queued scrape responses onto the response
/// stream, waking at least every `check` to notice a disconnect or
/// stop.
pub(crate) async fn write_responses<S: TransportStream>(
    mut stream: S,
    mut drain: ResponseDrain,
    session: Arc<SessionState>,
    stopped: Arc<AtomicBool>,
    metrics: Arc<AgentMetrics>,
    check: Duration,
) {
    while !session.is_disconnected() && !stopped.load(Ordering::Acquire) {
        let response = match drain.poll(check).await {
            Some(response) => response,
            None => continue,
        };
        metrics.dec_queue_size();
        let scrape_id = response.scrape_id;
        if let Err(e) = stream
            .send_message(&ProxyMessage::ScrapeResponse(response))
            .await
        {
            warn!(error = %e, "failed to write scrape response");
            session.set_disconnected();
            break;
        }
        session.mark_activity();
        trace!(scrape_id, "scrape response written");
    }
    if let Err(e) = stream.close().await {
        debug!(error = %e, "error closing response stream");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::response_queue;
    use crate::fetch::{FetchError, FetchedBody};
    use async_trait::async_trait;
    use metrelay_proto::{ScrapeRequest, ScrapeResponse};
    use metrelay_transport::memory::stream_pair;
    use tokio::time::sleep;

    struct RefusingFetcher;

    #[async_trait]
    impl ScrapeFetcher for RefusingFetcher {
        async fn fetch(&self, _url: &str) -> Result<FetchedBody, FetchError> {
            Err(FetchError {
                kind: "connect error",
                message: "connection refused".to_string(),
            })
        }
    }

    fn test_dispatcher(metrics: Arc<AgentMetrics>) -> Arc<ScrapeDispatcher> {
        let (queue, _drain) = response_queue(8);
        Arc::new(ScrapeDispatcher::new(
            Arc::new(PathRegistry::new()),
            Arc::new(RefusingFetcher),
            queue,
            metrics,
            4,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_time_tracks_activity() {
        let session = SessionState::new();
        assert!(session.idle_time() < Duration::from_millis(50));

        sleep(Duration::from_millis(200)).await;
        assert!(session.idle_time() >= Duration::from_millis(200));

        session.mark_activity();
        assert!(session.idle_time() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_identity_starts_empty() {
        let session = SessionState::new();
        assert!(session.identity().await.is_none());

        session.set_identity("agent-7").await;
        assert_eq!(session.identity().await.as_deref(), Some("agent-7"));
    }

    #[test]
    fn test_disconnected_flag() {
        let session = SessionState::new();
        assert!(!session.is_disconnected());
        session.set_disconnected();
        assert!(session.is_disconnected());
    }

    #[tokio::test]
    async fn test_read_requests_skips_unknown_frames_and_ends_on_close() {
        let (agent_side, mut proxy_side) = stream_pair();
        let session = SessionState::new();
        let metrics = Arc::new(AgentMetrics::new().unwrap());
        let dispatcher = test_dispatcher(metrics.clone());

        let pump = tokio::spawn(read_requests(agent_side, dispatcher, session.clone()));

        proxy_side
            .send_message(&ProxyMessage::ConnectAck)
            .await
            .unwrap();
        proxy_side
            .send_message(&ProxyMessage::ScrapeRequest(ScrapeRequest {
                agent_id: "agent-1".to_string(),
                scrape_id: 1,
                path: "missing".to_string(),
            }))
            .await
            .unwrap();
        proxy_side.close().await.unwrap();

        pump.await.unwrap();
        assert!(session.is_disconnected());
    }

    #[tokio::test]
    async fn test_write_responses_drains_queue() {
        let (agent_side, mut proxy_side) = stream_pair();
        let session = SessionState::new();
        let metrics = Arc::new(AgentMetrics::new().unwrap());
        let stopped = Arc::new(AtomicBool::new(false));
        let (queue, drain) = response_queue(8);

        let response = ScrapeResponse {
            agent_id: "agent-1".to_string(),
            scrape_id: 42,
            valid: true,
            status_code: 200,
            reason: String::new(),
            text: "up 1".to_string(),
            content_type: "text/plain".to_string(),
        };
        assert!(queue.put(response.clone()).await);

        let pump = tokio::spawn(write_responses(
            agent_side,
            drain,
            session.clone(),
            stopped,
            metrics,
            Duration::from_millis(50),
        ));

        match proxy_side.recv_message().await.unwrap() {
            Some(ProxyMessage::ScrapeResponse(written)) => assert_eq!(written, response),
            other => panic!("expected scrape response, got {other:?}"),
        }

        session.set_disconnected();
        pump.await.unwrap();
    }
}
