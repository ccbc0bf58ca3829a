//! Per-key sliding-window rate limiting.
//!
//! Each principal gets a [`WindowCounter`] tracking request timestamps and
//! `(timestamp, token_count)` pairs over a 60-second window. Entries older
//! than the window are pruned lazily on read — there is no background timer,
//! and memory grows only with in-window activity.
//!
//! Both checks run *before* forwarding; tokens are recorded only after a
//! call completes, so a burst of long token-heavy calls can overshoot TPM by
//! up to one in-flight call's worth. That is the accepted price of one-pass
//! streaming.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::GatewayError;

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window state for one key.
#[derive(Debug, Default)]
struct WindowCounter {
    /// Timestamps of admitted requests, oldest first.
    requests: Vec<Instant>,
    /// `(completion time, token count)` pairs, oldest first.
    tokens: Vec<(Instant, i64)>,
}

impl WindowCounter {
    fn prune(&mut self, now: Instant) {
        self.requests.retain(|&t| now.duration_since(t) < WINDOW);
        self.tokens.retain(|&(t, _)| now.duration_since(t) < WINDOW);
    }

    /// Whole seconds until the oldest in-window request expires:
    /// `max(1, ceil(60 − (now − oldest)) + 1)`.
    fn retry_after(&self, now: Instant) -> u64 {
        let Some(&oldest) = self.requests.first() else { return 1 };
        let wait = WINDOW.as_secs_f64() - now.duration_since(oldest).as_secs_f64();
        (wait.ceil() as i64 + 1).max(1) as u64
    }
}

/// Concurrent per-key rate limiter.
pub struct RateLimiter {
    counters: DashMap<String, WindowCounter>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { counters: DashMap::new() }
    }

    /// Admit or reject a request against the key's RPM limit. Admission
    /// appends the current instant to the window.
    ///
    /// Two concurrent calls may both observe `count < limit` and both be
    /// admitted; over-admission is bounded by the number of in-flight calls.
    pub fn check_request(&self, key: &str, rpm_limit: u32) -> Result<(), GatewayError> {
        let now = Instant::now();
        let mut counter = self.counters.entry(key.to_string()).or_default();
        counter.prune(now);

        let current = counter.requests.len() as u32;
        if current >= rpm_limit {
            return Err(GatewayError::RateLimited {
                current,
                limit: rpm_limit,
                retry_after: counter.retry_after(now),
            });
        }
        counter.requests.push(now);
        Ok(())
    }

    /// Record tokens consumed by a completed call.
    pub fn record_tokens(&self, key: &str, count: i64) {
        if count <= 0 {
            return;
        }
        let mut counter = self.counters.entry(key.to_string()).or_default();
        counter.tokens.push((Instant::now(), count));
    }

    /// Reject when the key's in-window token sum has reached its TPM limit.
    pub fn check_tokens(&self, key: &str, tpm_limit: i64) -> Result<(), GatewayError> {
        let now = Instant::now();
        let mut counter = self.counters.entry(key.to_string()).or_default();
        counter.prune(now);

        let current: i64 = counter.tokens.iter().map(|&(_, c)| c).sum();
        if current >= tpm_limit {
            return Err(GatewayError::TokenRateLimited { current, limit: tpm_limit });
        }
        Ok(())
    }

    /// Test hook: rewind every entry for `key` by `age`.
    #[cfg(test)]
    fn backdate(&self, key: &str, age: Duration) {
        if let Some(mut counter) = self.counters.get_mut(key) {
            for t in counter.requests.iter_mut() {
                *t = t.checked_sub(age).unwrap();
            }
            for (t, _) in counter.tokens.iter_mut() {
                *t = t.checked_sub(age).unwrap();
            }
        }
    }
}
