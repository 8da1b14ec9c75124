use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token bucket refilled continuously at `refill_rate` tokens per second.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32, now: Instant) -> Self {
        let capacity = f64::from(per_minute.max(1));
        Self {
            tokens: capacity,
            capacity,
            refill_rate: capacity / 60.0,
            last_update: now,
        }
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_update = now;
    }
}

/// Per-sender limiter for typed commands arriving over D-Bus.
///
/// Each sender gets a bucket holding one minute's worth of commands.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    per_minute: u32,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            per_minute,
        }
    }

    /// Consume a token for `sender`. Returns false when rate limited.
    pub fn check(&self, sender: &str) -> bool {
        self.check_at(sender, Instant::now())
    }

    fn check_at(&self, sender: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        buckets
            .entry(sender.to_string())
            .or_insert_with(|| TokenBucket::new(self.per_minute, now))
            .try_consume(now)
    }

    pub fn remaining(&self, sender: &str) -> u32 {
        let buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        buckets
            .get(sender)
            .map(|b| b.tokens.floor() as u32)
            .unwrap_or(self.per_minute)
    }

    /// Forget senders not seen for `max_age`.
    pub fn cleanup(&self, max_age: Duration) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_update) < max_age);
    }

    pub fn tracked_senders(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(30)
    }
}
