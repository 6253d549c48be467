//! One listing page and the purge lock it holds until every dispatched
//! object from it reached a terminal state.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug)]
pub struct ListingPage {
    id: Uuid,
    bucket: String,
    total: usize,
    resolved: AtomicUsize,
    /// Newest modification time among the items resolved as terminal.
    committed: Mutex<Option<DateTime<Utc>>>,
    purge_lock: Arc<AsyncMutex<()>>,
    held: Mutex<Option<OwnedMutexGuard<()>>>,
}

impl ListingPage {
    /// Creates a page with `total` work items, its purge lock held. A page
    /// without work items starts resolved.
    pub fn new(bucket: impl Into<String>, total: usize) -> Arc<Self> {
        let purge_lock = Arc::new(AsyncMutex::new(()));
        let held = if total > 0 {
            purge_lock.clone().try_lock_owned().ok()
        } else {
            None
        };
        Arc::new(Self {
            id: Uuid::new_v4(),
            bucket: bucket.into(),
            total,
            resolved: AtomicUsize::new(0),
            committed: Mutex::new(None),
            purge_lock,
            held: Mutex::new(held),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn resolved(&self) -> usize {
        self.resolved.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> Option<DateTime<Utc>> {
        *self.committed.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_purge_locked(&self) -> bool {
        self.purge_lock.try_lock().is_err()
    }

    /// Records one work item as resolved. `committed` is the modification
    /// time of an item that reached a terminal state. Returns true exactly
    /// once, for the item that resolved the page, after the purge lock was
    /// released.
    pub fn resolve_one(&self, committed: Option<DateTime<Utc>>) -> bool {
        if let Some(ts) = committed {
            let mut slot = self.committed.lock().unwrap_or_else(|e| e.into_inner());
            *slot = (*slot).max(Some(ts));
        }
        let resolved = self.resolved.fetch_add(1, Ordering::SeqCst) + 1;
        if resolved != self.total {
            return false;
        }
        let guard = self
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(guard);
        true
    }

    /// Waits until the page is fully resolved.
    pub async fn purged(&self) {
        let _guard = self.purge_lock.lock().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_lock_released_by_last_item_only() {
        let page = ListingPage::new("bucket", 3);
        let ts = |m| Utc.with_ymd_and_hms(2024, 1, 1, 0, m, 0).unwrap();
        assert!(page.is_purge_locked());
        assert!(!page.resolve_one(Some(ts(5))));
        assert!(!page.resolve_one(None));
        assert!(page.is_purge_locked());
        assert!(page.resolve_one(Some(ts(2))));
        assert!(!page.is_purge_locked());
        assert_eq!(page.resolved(), 3);
        assert_eq!(page.committed(), Some(ts(5)));
    }

    #[test]
    fn test_empty_page_starts_unlocked() {
        let page = ListingPage::new("bucket", 0);
        assert!(!page.is_purge_locked());
    }

    #[tokio::test]
    async fn test_purged_resolves_after_last_item() {
        let page = ListingPage::new("bucket", 1);
        let waiter = {
            let page = page.clone();
            tokio::spawn(async move { page.purged().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        page.resolve_one(None);
        waiter.await.unwrap();
    }
}
