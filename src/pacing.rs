//! Inter-target pacing
//!
//! Each target waits a random delay before it is probed so probing traffic
//! does not arrive in a regular rhythm. An optional shared rate limiter caps
//! the number of targets started per minute across all workers.

use async_trait::async_trait;
use governor::clock::{QuantaClock, QuantaInstant};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use rand::Rng;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

type TargetLimiter = RateLimiter<NotKeyed, InMemoryState, QuantaClock, NoOpMiddleware<QuantaInstant>>;

/// Source of delays. Production code sleeps on the tokio timer; tests
/// substitute a recorder.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Whether cancellation has been requested.
pub fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Resolve once cancellation is requested. A dropped sender never cancels.
pub async fn cancelled(mut cancel: watch::Receiver<bool>) {
    if cancel.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Jittered delay between targets plus an optional shared per-minute cap.
#[derive(Clone)]
pub struct Pacer {
    /// Minimum delay in milliseconds
    min_ms: u64,
    /// Maximum delay in milliseconds
    max_ms: u64,
    limiter: Option<Arc<TargetLimiter>>,
}

impl Pacer {
    /// Create a pacer with the given delay range.
    pub fn new(min_ms: u64, max_ms: u64) -> anyhow::Result<Self> {
        if min_ms > max_ms {
            return Err(anyhow::anyhow!(
                "Pacing minimum ({} ms) exceeds maximum ({} ms)",
                min_ms,
                max_ms
            ));
        }
        Ok(Self { min_ms, max_ms, limiter: None })
    }

    /// Pacer that never waits.
    pub fn disabled() -> Self {
        Self { min_ms: 0, max_ms: 0, limiter: None }
    }

    /// Additionally cap the number of targets started per minute.
    pub fn with_rate_limit(mut self, targets_per_minute: NonZeroU32) -> Self {
        self.limiter = Some(Arc::new(RateLimiter::direct(Quota::per_minute(targets_per_minute))));
        self
    }

    /// Random delay within the configured range.
    pub fn next_delay(&self) -> Duration {
        // Generate before any await so the future stays Send
        let delay_ms = {
            let mut rng = rand::thread_rng();
            rng.gen_range(self.min_ms..=self.max_ms)
        };
        Duration::from_millis(delay_ms)
    }

    /// Wait before the next target. Returns `false` when cancellation
    /// interrupted the wait.
    pub async fn pace(&self, sleeper: &dyn Sleeper, cancel: &watch::Receiver<bool>) -> bool {
        let delay = self.next_delay();
        let wait = async {
            if !delay.is_zero() {
                sleeper.sleep(delay).await;
            }
            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }
        };

        tokio::select! {
            _ = wait => !is_cancelled(cancel),
            _ = cancelled(cancel.clone()) => false,
        }
    }

    pub fn min_ms(&self) -> u64 {
        self.min_ms
    }

    pub fn max_ms(&self) -> u64 {
        self.max_ms
    }
}

impl Default for Pacer {
    /// 25 to 70 seconds between targets
    fn default() -> Self {
        Self { min_ms: 25_000, max_ms: 70_000, limiter: None }
    }
}
