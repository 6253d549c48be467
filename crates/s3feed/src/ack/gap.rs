//! Sent/dropped reconciliation for downstream acknowledgments.
//!
//! The sink acknowledges only events it actually received, in order. Events
//! dropped before reaching the sink still have to be reported back to their
//! producers, and they must be reported in the position they were recorded:
//! a drop that happened between two sends is released only once the send
//! before it has been acknowledged.
//!
//! The tracker keeps a FIFO chain of gap nodes. Each node holds a run of
//! sends followed by a trailing run of drops. Recording a send after drops
//! starts a new node, so a node never mixes drops in front of sends.
//!
//! Locking: the chain itself sits behind a list lock; counts live behind a
//! per-node lock. Producers touch only the tail node and acknowledgers only
//! the head, and the list lock is never requested while a node lock is held.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Fault;

/// Result of folding one acknowledgment (or one immediate drop) into the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckBatch {
    /// Sent events the sink acknowledged.
    pub acked: u64,
    /// Events released to producers: the acked sends plus every drop folded in.
    pub total: u64,
}

#[derive(Debug, Default)]
struct GapCounts {
    sent: u64,
    dropped: u64,
    /// Set once the node has been folded and unlinked.
    retired: bool,
}

#[derive(Debug, Default)]
struct GapNode {
    counts: Mutex<GapCounts>,
}

impl GapNode {
    fn with_sent(sent: u64) -> Self {
        Self {
            counts: Mutex::new(GapCounts {
                sent,
                ..GapCounts::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GapCounts> {
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug)]
pub struct AckGapTracker {
    chain: Mutex<VecDeque<Arc<GapNode>>>,
    /// Serializes acknowledgers; producers never take it.
    ack_serial: Mutex<()>,
    /// Sent events not yet acknowledged.
    outstanding: AtomicU64,
}

impl Default for AckGapTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AckGapTracker {
    pub fn new() -> Self {
        let mut chain = VecDeque::with_capacity(4);
        chain.push_back(Arc::new(GapNode::default()));
        Self {
            chain: Mutex::new(chain),
            ack_serial: Mutex::new(()),
            outstanding: AtomicU64::new(0),
        }
    }

    /// Sent events still waiting for an acknowledgment.
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Records one event handed to the sink.
    pub fn record_sent(&self) {
        loop {
            let tail = self.tail();
            {
                let mut counts = tail.lock();
                if !counts.retired && counts.dropped == 0 {
                    counts.sent += 1;
                    self.outstanding.fetch_add(1, Ordering::SeqCst);
                    return;
                }
            }

            // The tail ends in drops: open a new node so the drops stay a
            // trailing gap of the node before it.
            let mut chain = self.lock_chain();
            if chain.back().is_some_and(|t| Arc::ptr_eq(t, &tail)) {
                chain.push_back(Arc::new(GapNode::with_sent(1)));
                self.outstanding.fetch_add(1, Ordering::SeqCst);
                return;
            }
            // Another producer moved the tail first.
        }
    }

    /// Records one event dropped before reaching the sink.
    ///
    /// With nothing outstanding there is nothing to wait for: the drop is
    /// released immediately as `AckBatch { acked: 0, total: 1 }`.
    pub fn record_dropped(&self) -> Option<AckBatch> {
        loop {
            let tail = self.tail();
            let mut counts = tail.lock();
            if counts.retired {
                continue;
            }
            // Only the sole node is ever empty: appended nodes start with a
            // send and only the sole node is zeroed by an acknowledgment.
            if counts.sent == 0 && counts.dropped == 0 {
                return Some(AckBatch { acked: 0, total: 1 });
            }
            counts.dropped += 1;
            return None;
        }
    }

    /// Folds `n` sink acknowledgments into the chain, oldest node first.
    ///
    /// Acknowledging more events than were recorded as sent is a [`Fault`];
    /// nothing is consumed in that case.
    pub fn acknowledge(&self, n: u64) -> Result<AckBatch, Fault> {
        let _serial = self.ack_serial.lock().unwrap_or_else(|e| e.into_inner());

        let outstanding = self.outstanding.load(Ordering::SeqCst);
        if n > outstanding {
            return Err(Fault::OverAcknowledged {
                acked: n,
                outstanding,
            });
        }

        let mut remaining = n;
        let mut total = 0u64;
        while remaining > 0 {
            let (head, sole) = {
                let chain = self.lock_chain();
                match chain.front() {
                    Some(head) => (head.clone(), chain.len() == 1),
                    None => break,
                }
            };

            let mut counts = head.lock();
            if remaining < counts.sent {
                counts.sent -= remaining;
                total += remaining;
                remaining = 0;
                break;
            }

            if sole && counts.sent == 0 {
                // Outstanding said there were more sends than the chain holds.
                break;
            }

            remaining -= counts.sent;
            total += counts.sent + counts.dropped;

            if sole {
                counts.sent = 0;
                counts.dropped = 0;
            } else {
                counts.retired = true;
                drop(counts);
                self.lock_chain().pop_front();
            }
        }

        let consumed = n - remaining;
        self.outstanding.fetch_sub(consumed, Ordering::SeqCst);
        if remaining > 0 {
            return Err(Fault::OverAcknowledged {
                acked: n,
                outstanding: consumed,
            });
        }

        Ok(AckBatch { acked: n, total })
    }

    fn tail(&self) -> Arc<GapNode> {
        let mut chain = self.lock_chain();
        if let Some(tail) = chain.back() {
            return tail.clone();
        }
        let node = Arc::new(GapNode::default());
        chain.push_back(node.clone());
        node
    }

    fn lock_chain(&self) -> MutexGuard<'_, VecDeque<Arc<GapNode>>> {
        self.chain.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn node_counts(&self) -> Vec<(u64, u64)> {
        self.lock_chain()
            .iter()
            .map(|node| {
                let c = node.lock();
                (c.sent, c.dropped)
            })
            .collect()
    }
}
