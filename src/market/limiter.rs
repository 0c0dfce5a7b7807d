//! Outbound request pacing for the upstream price API
//!
//! One limiter instance is owned by the price client and every outbound
//! call (price, historical, liveness, asset list) takes a slot from it, so
//! the whole process is capped to the configured requests-per-minute quota.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, timeout, Instant};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("timed out waiting for a rate-limit slot")]
pub struct SlotTimeout;

/// Enforces a minimum spacing of `60s / quota` between grants.
///
/// The lock is held across the check-and-sleep, so concurrent callers
/// queue up and outbound traffic is strictly serialized to one request per
/// interval. A caller cancelled mid-wait (dropped future, timeout) releases
/// the lock without consuming the slot.
pub struct RateLimiter {
    interval: Duration,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    last_grant: Option<Instant>,
}

impl RateLimiter {
    /// `max_per_minute` of zero is clamped to one request per minute.
    pub fn new(max_per_minute: u32) -> Self {
        let quota = max_per_minute.max(1);
        Self {
            interval: Duration::from_secs(60) / quota,
            state: Mutex::new(LimiterState { last_grant: None }),
        }
    }

    /// Minimum spacing between grants.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Block until the next slot is free, then claim it.
    pub async fn acquire_slot(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if let Some(last) = state.last_grant {
            let next_free = last + self.interval;
            if next_free > now {
                sleep_until(next_free).await;
                state.last_grant = Some(Instant::now());
                return;
            }
        }

        state.last_grant = Some(now);
    }

    /// Like `acquire_slot`, but give up after `limit`. No slot is consumed
    /// on timeout.
    pub async fn acquire_slot_timeout(&self, limit: Duration) -> Result<(), SlotTimeout> {
        timeout(limit, self.acquire_slot())
            .await
            .map_err(|_| SlotTimeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_from_quota() {
        assert_eq!(RateLimiter::new(60).interval(), Duration::from_secs(1));
        assert_eq!(RateLimiter::new(120).interval(), Duration::from_millis(500));
        // Zero quota must not divide by zero
        assert_eq!(RateLimiter::new(0).interval(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_slot_is_immediate() {
        let limiter = RateLimiter::new(60);
        let start = Instant::now();
        limiter.acquire_slot().await;
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_n_slots_take_n_minus_one_intervals() {
        let limiter = RateLimiter::new(60);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire_slot().await;
        }
        assert!(Instant::now() - start >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_serialize() {
        let limiter = std::sync::Arc::new(RateLimiter::new(60));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire_slot().await;
                Instant::now()
            }));
        }

        let mut grant_times = Vec::new();
        for handle in handles {
            grant_times.push(handle.await.unwrap());
        }
        grant_times.sort();

        // Three callers racing for slots still space out one per second
        assert!(grant_times[2] - start >= Duration::from_secs(2));
        assert!(grant_times[2] - grant_times[1] >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_consume_slot() {
        let limiter = RateLimiter::new(60);
        limiter.acquire_slot().await;

        let err = limiter
            .acquire_slot_timeout(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, SlotTimeout);

        // The failed attempt left the clock untouched: the next slot opens
        // one interval after the first grant, not after the timeout.
        let start = Instant::now();
        limiter.acquire_slot().await;
        assert!(Instant::now() - start <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_succeeds_when_slot_free() {
        let limiter = RateLimiter::new(60);
        limiter
            .acquire_slot_timeout(Duration::from_secs(5))
            .await
            .unwrap();
    }
}
