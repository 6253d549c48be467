//! Counting semaphore bounding in-flight messages and poller workers.
//!
//! `acquire(n)` grants between one and `n` units, whatever is available once
//! at least one unit is free. Each `release` wakes a single waiter; a woken
//! waiter that still finds nothing available goes back to sleep.

use std::sync::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Returned when the cancellation token fires before any unit was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("semaphore acquire cancelled")]
pub struct AcquireCancelled;

#[derive(Debug)]
pub struct CountingSemaphore {
    capacity: usize,
    available: Mutex<usize>,
    released: Notify,
}

impl CountingSemaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            available: Mutex::new(capacity),
            released: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Waits until at least one unit is free and takes up to `n` of them.
    /// Returns 0 without waiting when `n == 0`.
    pub async fn acquire(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        loop {
            // Register interest before checking so a release between the
            // check and the await is not missed.
            let released = self.released.notified();
            if let Some(granted) = self.try_take(n) {
                return granted;
            }
            released.await;
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up as soon as `cancel` fires.
    /// Nothing is granted on cancellation.
    pub async fn acquire_with_cancel(
        &self,
        n: usize,
        cancel: &CancellationToken,
    ) -> Result<usize, AcquireCancelled> {
        if cancel.is_cancelled() {
            return Err(AcquireCancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AcquireCancelled),
            granted = self.acquire(n) => Ok(granted),
        }
    }

    /// Returns `n` units and wakes one waiter.
    pub fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        {
            let mut available = self.lock();
            let returned = available.saturating_add(n);
            if returned > self.capacity {
                tracing::warn!(
                    capacity = self.capacity,
                    available = *available,
                    released = n,
                    "semaphore released more units than it hands out"
                );
            }
            *available = returned.min(self.capacity);
        }
        self.released.notify_one();
    }

    /// Point-in-time snapshot, for observability only.
    pub fn available(&self) -> usize {
        *self.lock()
    }

    fn try_take(&self, n: usize) -> Option<usize> {
        let mut available = self.lock();
        if *available == 0 {
            return None;
        }
        let granted = n.min(*available);
        *available -= granted;
        Some(granted)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, usize> {
        self.available.lock().unwrap_or_else(|e| e.into_inner())
    }
}
