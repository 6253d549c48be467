//! Escalation path for invariant violations.
//!
//! A [`Fault`] means the ack bookkeeping is broken; continuing would risk
//! deleting queue messages or purging state for data that was never
//! delivered. The first fault is captured and the root token is cancelled so
//! every driver stops without finalizing anything further.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::Fault;

#[derive(Clone, Debug)]
pub struct FaultHandler {
    inner: Arc<FaultInner>,
}

#[derive(Debug)]
struct FaultInner {
    triggered: AtomicBool,
    root_shutdown: CancellationToken,
    captured: Mutex<Option<Fault>>,
}

impl FaultHandler {
    pub fn new(root_shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(FaultInner {
                triggered: AtomicBool::new(false),
                root_shutdown,
                captured: Mutex::new(None),
            }),
        }
    }

    pub fn trigger(&self, context: &str, fault: Fault) {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            tracing::error!(context, fault = %fault, "additional fault after shutdown was initiated");
            return;
        }

        tracing::error!(context, fault = %fault, "invariant violated; initiating shutdown");
        {
            let mut slot = self.inner.captured.lock().unwrap_or_else(|e| e.into_inner());
            slot.get_or_insert(fault);
        }
        self.inner.root_shutdown.cancel();
    }

    /// The first fault captured, if any.
    pub fn fault(&self) -> Option<Fault> {
        self.inner
            .captured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
