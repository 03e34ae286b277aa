//! Minimum-interval throttle shared by everything that talks to a metered
//! collaborator (LLM providers, external converters).
//!
//! Callers reserve the next free slot under a short lock and sleep outside
//! it, so concurrent callers queue up one interval apart instead of waking
//! together.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

pub struct RateLimiter {
    interval: Duration,
    next: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits until the caller may proceed.
    pub async fn wait(&self) {
        let now = Instant::now();
        let slot = {
            let mut next = self.next.lock().await;
            let slot = next.map_or(now, |n| n.max(now));
            *next = Some(slot + self.interval);
            slot
        };
        if slot > now {
            debug!(delay = ?(slot - now), "rate limited, waiting");
            sleep_until(slot).await;
        }
    }
}
