// =============================================================================
// Adaptive Rate Limiter — token bucket with 429-triggered backoff
//
// Generalizes the request-weight tracker into a cooperative limiter any
// pipeline stage can `throttle().await` against. A 429 doubles the
// effective interval between grants (capped at 16x); five minutes without
// a further 429 halves it back down.
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

const MAX_BACKOFF_MULTIPLIER: u32 = 16;
const RECOVERY_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterSnapshot {
    pub tokens_available: u32,
    pub capacity: u32,
    pub backoff_multiplier: u32,
}

pub struct RateLimiter {
    capacity: u32,
    refill_per_sec: u32,
    tokens: AtomicU32,
    last_refill: Mutex<Instant>,
    backoff_multiplier: AtomicU32,
    last_429: Mutex<Option<Instant>>,
    total_429s: AtomicU64,
}

impl RateLimiter {
    pub fn new(requests_per_sec: u32) -> Self {
        Self {
            capacity: requests_per_sec,
            refill_per_sec: requests_per_sec,
            tokens: AtomicU32::new(requests_per_sec),
            last_refill: Mutex::new(Instant::now()),
            backoff_multiplier: AtomicU32::new(1),
            last_429: Mutex::new(None),
            total_429s: AtomicU64::new(0),
        }
    }

    fn refill(&self) {
        let mut last = self.last_refill.lock();
        let elapsed = last.elapsed();
        let multiplier = self.backoff_multiplier.load(Ordering::Relaxed);
        let effective_rate = (self.refill_per_sec as f64 / multiplier as f64).max(0.1);
        let new_tokens = (elapsed.as_secs_f64() * effective_rate) as u32;
        if new_tokens > 0 {
            let current = self.tokens.load(Ordering::Relaxed);
            self.tokens
                .store((current + new_tokens).min(self.capacity), Ordering::Relaxed);
            *last = Instant::now();
        }
    }

    /// Block cooperatively until a token is available.
    pub async fn throttle(&self) {
        loop {
            self.maybe_recover();
            self.refill();
            let current = self.tokens.load(Ordering::Relaxed);
            if current > 0
                && self
                    .tokens
                    .compare_exchange(current, current - 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Call when the broker returns HTTP 429. Doubles the backoff
    /// multiplier, capped at 16x.
    pub fn on_rate_limited(&self) {
        let prev = self.backoff_multiplier.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |m| Some((m * 2).min(MAX_BACKOFF_MULTIPLIER)),
        );
        if let Ok(old) = prev {
            let new = (old * 2).min(MAX_BACKOFF_MULTIPLIER);
            warn!(old_multiplier = old, new_multiplier = new, "rate limited by broker, backing off");
        }
        *self.last_429.lock() = Some(Instant::now());
        self.total_429s.fetch_add(1, Ordering::Relaxed);
    }

    /// Halve the backoff multiplier after a clean recovery window with no
    /// further 429s.
    fn maybe_recover(&self) {
        let mut last_429 = self.last_429.lock();
        if let Some(at) = *last_429 {
            if at.elapsed() >= RECOVERY_WINDOW {
                let current = self.backoff_multiplier.load(Ordering::Relaxed);
                if current > 1 {
                    self.backoff_multiplier.store((current / 2).max(1), Ordering::Relaxed);
                }
                *last_429 = None;
            }
        }
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        RateLimiterSnapshot {
            tokens_available: self.tokens.load(Ordering::Relaxed),
            capacity: self.capacity,
            backoff_multiplier: self.backoff_multiplier.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("tokens", &self.tokens.load(Ordering::Relaxed))
            .field("backoff_multiplier", &self.backoff_multiplier.load(Ordering::Relaxed))
            .finish()
    }
}
