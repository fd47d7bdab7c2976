use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

/// Throttle applied between consecutive image calls of one run.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, completed_index: usize);
}

#[derive(Debug, Clone, Copy)]
pub struct FixedDelayPacer {
    delay: Duration,
}

impl FixedDelayPacer {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Pacer for FixedDelayPacer {
    async fn pause(&self, completed_index: usize) {
        if self.delay.is_zero() {
            return;
        }
        debug!(
            "Pausing {:?} after image {} to respect upstream rate limits",
            self.delay,
            completed_index + 1
        );
        tokio::time::sleep(self.delay).await;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoPacing;

#[async_trait]
impl Pacer for NoPacing {
    async fn pause(&self, _completed_index: usize) {}
}
