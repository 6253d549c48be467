//! Consecutive-failure breaker for listing calls.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    failures: AtomicU32,
}

impl CircuitBreaker {
    /// A threshold of 0 is treated as 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: AtomicU32::new(0),
        }
    }

    /// Counts a failure. Returns true when the threshold is reached.
    pub fn record_failure(&self) -> bool {
        self.failures.fetch_add(1, Ordering::SeqCst) + 1 >= self.threshold
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.failures.load(Ordering::SeqCst) >= self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}
