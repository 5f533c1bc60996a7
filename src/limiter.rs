//! Token-bucket pacing for the send path
//!
//! Debt model: every acquire adds its byte count to an outstanding debt
//! that drains at the configured rate. A worker only sleeps once its
//! debt exceeds one second's worth of tokens, which gives short bursts
//! for free while holding the long-run rate.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

pub struct RateLimiter {
    /// Bytes per second.
    rate: u64,
    /// Burst allowance before sleeping: one second of tokens.
    capacity: u64,
    state: Mutex<State>,
}

struct State {
    debt: u64,
    last: Instant,
}

impl RateLimiter {
    /// `rate` is in bytes per second and must be non-zero; a zero limit
    /// means "no limiter" and is the caller's case to handle.
    pub fn new(rate: u64) -> RateLimiter {
        assert!(rate > 0);
        RateLimiter {
            rate,
            capacity: rate,
            state: Mutex::new(State {
                debt: 0,
                last: Instant::now(),
            }),
        }
    }

    /// Wait until `n` bytes fit under the configured rate.
    pub async fn acquire(&self, n: u64) {
        let wait = {
            let mut s = self.state.lock();
            let now = Instant::now();
            let elapsed_us = now.duration_since(s.last).as_micros().min(u64::MAX as u128) as u64;
            let repaid = elapsed_us.saturating_mul(self.rate) / 1_000_000;
            s.debt = s.debt.saturating_sub(repaid);
            s.last = now;

            s.debt = s.debt.saturating_add(n);
            if s.debt > self.capacity {
                let over = s.debt - self.capacity;
                Some(Duration::from_micros(over.saturating_mul(1_000_000) / self.rate))
            } else {
                None
            }
        };

        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
    }
}
