//! Per-source request pacing.
//!
//! Every outbound request passes through `acquire`, which enforces a minimum
//! interval between requests to the same source. The limiter never errors and
//! never drops a request; it only delays the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

/// State for a single source.
#[derive(Debug, Clone)]
struct SourceState {
    /// Minimum interval between requests to this source.
    delay: Duration,
    /// Last request time.
    last_request: Option<Instant>,
    /// Hold-off deadline imposed by `penalize`, beyond the normal interval.
    penalty_until: Option<Instant>,
    /// Total requests made.
    total_requests: u64,
}

impl SourceState {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_request: None,
            penalty_until: None,
            total_requests: 0,
        }
    }

    /// Time until this source is ready for another request.
    fn time_until_ready(&self, now: Instant) -> Duration {
        let interval_wait = match self.last_request {
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                self.delay.saturating_sub(elapsed)
            }
            None => Duration::ZERO,
        };
        let penalty_wait = match self.penalty_until {
            Some(until) => until.saturating_duration_since(now),
            None => Duration::ZERO,
        };
        interval_wait.max(penalty_wait)
    }
}

/// Rate limiter shared across all adapters; one independent interval per
/// source. Cloning shares the underlying state.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    default_delay: Duration,
    sources: Arc<RwLock<HashMap<String, SourceState>>>,
}

impl RateLimiter {
    pub fn new(default_delay: Duration) -> Self {
        Self {
            default_delay,
            sources: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Override the interval for one source.
    pub async fn set_delay(&self, source: &str, delay: Duration) {
        let mut sources = self.sources.write().await;
        sources
            .entry(source.to_string())
            .or_insert_with(|| SourceState::new(delay))
            .delay = delay;
    }

    /// Configured interval for a source.
    pub async fn delay_for(&self, source: &str) -> Duration {
        let sources = self.sources.read().await;
        sources
            .get(source)
            .map(|s| s.delay)
            .unwrap_or(self.default_delay)
    }

    /// Wait until the source is ready, then mark a request as started.
    pub async fn acquire(&self, source: &str) {
        let wait = {
            let sources = self.sources.read().await;
            sources
                .get(source)
                .map(|s| s.time_until_ready(Instant::now()))
                .unwrap_or(Duration::ZERO)
        };

        if wait > Duration::ZERO {
            debug!("Rate limiting {}: waiting {:?}", source, wait);
            tokio::time::sleep(wait).await;
        }

        let mut sources = self.sources.write().await;
        let state = sources
            .entry(source.to_string())
            .or_insert_with(|| SourceState::new(self.default_delay));
        state.last_request = Some(Instant::now());
        state.penalty_until = None;
        state.total_requests += 1;
    }

    /// Push the source's next-ready time out by at least `extra` from now.
    /// Used after provider-reported throttling so the retry does not land
    /// inside the provider's cool-down window.
    pub async fn penalize(&self, source: &str, extra: Duration) {
        let mut sources = self.sources.write().await;
        let state = sources
            .entry(source.to_string())
            .or_insert_with(|| SourceState::new(self.default_delay));
        let until = Instant::now() + extra;
        state.penalty_until = Some(match state.penalty_until {
            Some(existing) => existing.max(until),
            None => until,
        });
    }

    /// Total requests issued to a source so far.
    pub async fn request_count(&self, source: &str) -> u64 {
        let sources = self.sources.read().await;
        sources.get(source).map(|s| s.total_requests).unwrap_or(0)
    }
}
