use std::sync::Arc;
use std::time::Duration;

use metrelay_proto::{ScrapeRequest, ScrapeResponse};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

use crate::fetch::ScrapeFetcher;
use crate::metrics::{
    AgentMetrics, SCRAPE_FETCH_ERROR, SCRAPE_INVALID_PATH, SCRAPE_UNSUCCESSFUL, SCRAPE_VALID,
};
use crate::registry::PathRegistry;

/// Producer half of the scrape response queue. `put` waits for room,
/// so fetch tasks slow down when the outbound stream falls behind.
#[derive(Clone)]
pub(crate) struct ResponseQueue {
    tx: mpsc::Sender<ScrapeResponse>,
}

impl ResponseQueue {
    /// Queues a response. Returns false when the session's drain is
    /// gone and the response was dropped.
    pub async fn put(&self, response: ScrapeResponse) -> bool {
        self.tx.send(response).await.is_ok()
    }
}

/// Consumer half of the scrape response queue, owned by the outbound
/// pump.
pub(crate) struct ResponseDrain {
    rx: mpsc::Receiver<ScrapeResponse>,
}

impl ResponseDrain {
    /// Waits up to `wait` for the next queued response.
    pub async fn poll(&mut self, wait: Duration) -> Option<ScrapeResponse> {
        timeout(wait, self.rx.recv()).await.ok().flatten()
    }
}

pub(crate) fn response_queue(capacity: usize) -> (ResponseQueue, ResponseDrain) {
    let (tx, rx) = mpsc::channel(capacity);
    (ResponseQueue { tx }, ResponseDrain { rx })
}

/// Turns scrape requests into scrape responses. Each request runs in
/// its own task, with a semaphore bounding how many fetches are in
/// flight at once.
pub(crate) struct ScrapeDispatcher {
    registry: Arc<PathRegistry>,
    fetcher: Arc<dyn ScrapeFetcher>,
    queue: ResponseQueue,
    metrics: Arc<AgentMetrics>,
    fetch_slots: Arc<Semaphore>,
}

impl ScrapeDispatcher {
    pub fn new(
        registry: Arc<PathRegistry>,
        fetcher: Arc<dyn ScrapeFetcher>,
        queue: ResponseQueue,
        metrics: Arc<AgentMetrics>,
        max_concurrent_fetches: usize,
    ) -> Self {
        Self {
            registry,
            fetcher,
            queue,
            metrics,
            fetch_slots: Arc::new(Semaphore::new(max_concurrent_fetches)),
        }
    }

    /// Spawns a task handling one scrape request.
    pub fn dispatch(self: &Arc<Self>, request: ScrapeRequest) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.run_one(request).await;
        });
    }

    async fn run_one(&self, request: ScrapeRequest) {
        let _permit = match self.fetch_slots.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let response = self.execute(&request).await;
        if self.queue.put(response).await {
            self.metrics.inc_queue_size();
        } else {
            debug!(
                scrape_id = request.scrape_id,
                "session ended, dropping scrape response"
            );
        }
    }

    /// Runs one scrape. Unknown path, 2xx, non-2xx and fetch failure
    /// each map onto a fixed response shape.
    async fn execute(&self, request: &ScrapeRequest) -> ScrapeResponse {
        let context = match self.registry.lookup(&request.path).await {
            Some(context) => context,
            None => {
                warn!(path = %request.path, "scrape request for unregistered path");
                self.metrics.inc_scrape(SCRAPE_INVALID_PATH);
                return invalid_response(request, 404, format!("Invalid path: {}", request.path));
            }
        };

        trace!(path = %context.path, url = %context.url, "fetching");
        let started = Instant::now();
        let fetched = self.fetcher.fetch(&context.url).await;
        self.metrics.observe_scrape_latency(started.elapsed());

        match fetched {
            Ok(body) if (200..300).contains(&body.status) => {
                self.metrics.inc_scrape(SCRAPE_VALID);
                ScrapeResponse {
                    agent_id: request.agent_id.clone(),
                    scrape_id: request.scrape_id,
                    valid: true,
                    status_code: body.status,
                    reason: String::new(),
                    text: body.text,
                    content_type: body.content_type,
                }
            }
            Ok(body) => {
                self.metrics.inc_scrape(SCRAPE_UNSUCCESSFUL);
                invalid_response(
                    request,
                    body.status,
                    format!("Unsuccessful response code {}", body.status),
                )
            }
            Err(e) => {
                warn!(url = %context.url, error = %e, "scrape fetch failed");
                self.metrics.inc_scrape(SCRAPE_FETCH_ERROR);
                invalid_response(request, 404, e.to_string())
            }
        }
    }
}

fn invalid_response(request: &ScrapeRequest, status_code: u16, reason: String) -> ScrapeResponse {
    ScrapeResponse {
        agent_id: request.agent_id.clone(),
        scrape_id: request.scrape_id,
        valid: false,
        status_code,
        reason,
        text: String::new(),
        content_type: String::new(),
    }
}
