//! Server-wide counter shared by every connection.
//!
//! The only access is [`Counter::add_and_get`], a single atomic
//! fetch-and-add; adding zero reads the current value. All connections
//! observe one total order of increments.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared unsigned 64-bit counter.
///
/// Cloning is cheap and every clone refers to the same value.
#[derive(Clone, Debug, Default)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    /// Create a counter starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` and return the value immediately after the addition.
    ///
    /// Overflow wraps around like ordinary unsigned arithmetic.
    pub fn add_and_get(&self, amount: u64) -> u64 {
        self.value
            .fetch_add(amount, Ordering::SeqCst)
            .wrapping_add(amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_add_and_get() {
        let counter = Counter::new();
        assert_eq!(counter.add_and_get(1), 1);
        assert_eq!(counter.add_and_get(5), 6);
        assert_eq!(counter.add_and_get(2), 8);
        assert_eq!(counter.add_and_get(0), 8);
    }

    #[test]
    fn test_zero_increment_reads_current_value() {
        let counter = Counter::new();
        counter.add_and_get(41);
        assert_eq!(counter.add_and_get(0), 41);
        assert_eq!(counter.add_and_get(0), 41);
    }

    #[test]
    fn test_wraps_on_overflow() {
        let counter = Counter::new();
        counter.add_and_get(u64::MAX);
        assert_eq!(counter.add_and_get(2), 1);
    }

    #[test]
    fn test_clones_share_value() {
        let a = Counter::new();
        let b = a.clone();
        a.add_and_get(3);
        assert_eq!(b.add_and_get(4), 7);
    }

    #[test]
    fn test_concurrent_adds_sum_exactly() {
        let counter = Counter::new();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let counter = counter.clone();
                thread::spawn(move || {
                    let mut seen = Vec::with_capacity(1000);
                    for _ in 0..1000 {
                        seen.push(counter.add_and_get(t + 1));
                    }
                    seen
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        let expected: u64 = (1..=8).map(|t| t * 1000).sum();
        assert_eq!(counter.add_and_get(0), expected);

        // Every returned value is distinct: each add observed a unique prefix.
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8000);
    }
}
