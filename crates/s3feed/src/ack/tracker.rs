//! Per unit-of-work acknowledgment counter.
//!
//! One tracker is shared by the object processor (which calls [`add`] for
//! every published record) and the publish client (which calls [`ack`] once
//! the sink accepted the record). The done signal fires exactly once, when
//! the expected count is sealed and every expected record was acked.
//!
//! [`add`]: EventAckTracker::add
//! [`ack`]: EventAckTracker::ack

use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Fault, ProcessError};

#[derive(Debug, Default)]
struct Counts {
    added: u64,
    acked: u64,
    expected: Option<u64>,
}

#[derive(Debug, Default)]
pub struct EventAckTracker {
    counts: Mutex<Counts>,
    done: CancellationToken,
}

impl EventAckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one more record that will be acked later.
    pub fn add(&self) {
        self.lock().added += 1;
    }

    /// Seals the expected count. Only the first call has an effect.
    pub fn mark_expected(&self, n: u64) {
        let mut counts = self.lock();
        if counts.expected.is_some() {
            return;
        }
        counts.expected = Some(n);
        self.check_done(&counts);
    }

    /// Acknowledges one previously added record.
    pub fn ack(&self) -> Result<(), Fault> {
        let mut counts = self.lock();
        if counts.acked >= counts.added {
            return Err(Fault::NegativePending);
        }
        counts.acked += 1;
        self.check_done(&counts);
        Ok(())
    }

    /// Records added but not yet acked.
    pub fn pending(&self) -> u64 {
        let counts = self.lock();
        counts.added - counts.acked
    }

    pub fn added(&self) -> u64 {
        self.lock().added
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Seals the expected count at the number of records added so far and
    /// waits for all of them to be acked. Resolves immediately if nothing
    /// was added.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), ProcessError> {
        let added = self.added();
        self.mark_expected(added);

        tokio::select! {
            biased;
            _ = self.done.cancelled() => Ok(()),
            _ = cancel.cancelled() => Err(ProcessError::Cancelled),
        }
    }

    fn check_done(&self, counts: &Counts) {
        if counts.expected.is_some_and(|expected| counts.acked >= expected) {
            self.done.cancel();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_without_adds_resolves_immediately() {
        let tracker = EventAckTracker::new();
        tracker.wait(&CancellationToken::new()).await.unwrap();
        assert!(tracker.is_done());
    }

    #[tokio::test]
    async fn wait_returns_only_after_last_ack() {
        let tracker = Arc::new(EventAckTracker::new());
        tracker.add();
        tracker.add();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait(&CancellationToken::new()).await })
        };

        tracker.ack().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tracker.ack().unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should complete")
            .unwrap()
            .unwrap();
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn acks_before_sealing_complete_on_seal() {
        let tracker = EventAckTracker::new();
        tracker.add();
        tracker.ack().unwrap();
        assert!(!tracker.is_done());

        tracker.wait(&CancellationToken::new()).await.unwrap();
        assert!(tracker.is_done());
    }

    #[test]
    fn mark_expected_is_idempotent() {
        let tracker = EventAckTracker::new();
        tracker.add();
        tracker.add();
        tracker.mark_expected(2);
        tracker.mark_expected(1);

        tracker.ack().unwrap();
        assert!(!tracker.is_done());
        tracker.ack().unwrap();
        assert!(tracker.is_done());
    }

    #[test]
    fn ack_without_pending_is_a_fault() {
        let tracker = EventAckTracker::new();
        assert_eq!(tracker.ack(), Err(Fault::NegativePending));
    }

    #[tokio::test]
    async fn cancellation_abandons_the_wait() {
        let tracker = EventAckTracker::new();
        tracker.add();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            tracker.wait(&cancel).await,
            Err(ProcessError::Cancelled)
        ));
        assert!(!tracker.is_done());
    }
}
