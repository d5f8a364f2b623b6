//! Token-bucket rate limiting for task starts.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// A token bucket with continuous refill.
///
/// Capacity equals the per-minute rate; starting a task consumes one
/// token. `try_acquire` never blocks — callers defer denied starts to
/// their next tick.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket allowing `rate` acquisitions per minute
    pub fn per_minute(rate: u32) -> Self {
        let capacity = rate as f64;
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// How long until a token becomes available, zero if one already is
    pub fn time_to_token(&self) -> Duration {
        let state = self.state.lock().unwrap();
        if state.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
        }
    }
}
