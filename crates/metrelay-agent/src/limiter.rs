use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Token bucket holding one token that refills every `min_pause`.
/// Callers take a token before each reconnect attempt, which spaces
/// attempts out without ever queueing more than the callers themselves.
pub(crate) struct ReconnectLimiter {
    min_pause: Duration,
    next_ready: Mutex<Instant>,
}

impl ReconnectLimiter {
    /// The first acquire after construction returns immediately;
    /// callers that want every acquire spaced take that token up front.
    pub fn new(min_pause: Duration) -> Self {
        Self {
            min_pause,
            next_ready: Mutex::new(Instant::now()),
        }
    }

    /// Takes a token, sleeping until one is available. Returns the time
    /// spent waiting.
    pub async fn acquire(&self) -> Duration {
        let wait = {
            let mut next_ready = self.next_ready.lock().await;
            let now = Instant::now();
            let wait = next_ready.duration_since(now);
            *next_ready = now.max(*next_ready) + self.min_pause;
            wait
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
        wait
    }
}
