use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

/// Scrape outcome labels for `agent_scrape_requests`.
pub(crate) const SCRAPE_VALID: &str = "valid";
pub(crate) const SCRAPE_INVALID_PATH: &str = "invalid_path";
pub(crate) const SCRAPE_UNSUCCESSFUL: &str = "unsuccessful";
pub(crate) const SCRAPE_FETCH_ERROR: &str = "fetch_error";

/// Connection outcome labels for `agent_connect_count`.
pub(crate) const CONNECT_ATTEMPT: &str = "attempt";
pub(crate) const CONNECT_SUCCESS: &str = "success";
pub(crate) const CONNECT_FAILURE: &str = "failure";

/// Counters and gauges kept by a single agent. Each agent owns its own
/// registry so several agents can live in one process.
pub struct AgentMetrics {
    registry: Registry,
    scrape_requests: IntCounterVec,
    connect_count: IntCounterVec,
    scrape_latency: Histogram,
    queue_size: IntGauge,
}

impl AgentMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let scrape_requests = IntCounterVec::new(
            Opts::new("agent_scrape_requests", "Scrape requests by outcome"),
            &["type"],
        )?;
        registry.register(Box::new(scrape_requests.clone()))?;

        let connect_count = IntCounterVec::new(
            Opts::new("agent_connect_count", "Proxy connections by outcome"),
            &["type"],
        )?;
        registry.register(Box::new(connect_count.clone()))?;

        let scrape_latency = Histogram::with_opts(HistogramOpts::new(
            "agent_scrape_request_latency_seconds",
            "Scrape request latency in seconds",
        ))?;
        registry.register(Box::new(scrape_latency.clone()))?;

        let queue_size = IntGauge::new(
            "agent_scrape_queue_size",
            "Scrape responses waiting for the outbound stream",
        )?;
        registry.register(Box::new(queue_size.clone()))?;

        Ok(Self {
            registry,
            scrape_requests,
            connect_count,
            scrape_latency,
            queue_size,
        })
    }

    /// Registry holding this agent's metrics, for exposition.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn inc_scrape(&self, outcome: &str) {
        self.scrape_requests.with_label_values(&[outcome]).inc();
    }

    pub(crate) fn inc_connect(&self, outcome: &str) {
        self.connect_count.with_label_values(&[outcome]).inc();
    }

    pub(crate) fn observe_scrape_latency(&self, elapsed: Duration) {
        self.scrape_latency.observe(elapsed.as_secs_f64());
    }

    pub(crate) fn inc_queue_size(&self) {
        self.queue_size.inc();
    }

    pub(crate) fn dec_queue_size(&self) {
        self.queue_size.dec();
    }

    pub(crate) fn reset_queue_size(&self) {
        self.queue_size.set(0);
    }

    #[cfg(test)]
    pub(crate) fn scrape_count(&self, outcome: &str) -> u64 {
        self.scrape_requests.with_label_values(&[outcome]).get()
    }
}
