//! Pseudo-random increment workload.
//!
//! Drives the load-generating client and the stress tests. Uses xorshift64,
//! so a given seed always produces the same sequence. Not cryptographically
//! secure.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Workload {
    state: u64,
}

impl Workload {
    /// Create a workload from `seed`. A zero seed is replaced with 1.
    pub const fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Next increment amount in `[0, max)`. Always 0 when `max` is 0.
    pub fn next_amount(&mut self, max: u64) -> u64 {
        if max == 0 {
            return 0;
        }
        self.next_u64() % max
    }

    /// Next pause between requests, in `[0, max)`.
    pub fn next_pause(&mut self, max: Duration) -> Duration {
        let max_ms = max.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(self.next_amount(max_ms))
    }
}
