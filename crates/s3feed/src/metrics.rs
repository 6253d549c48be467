//! Input counters shared by the drivers and the object processor

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct InputMetrics {
    pub sqs_messages_received: AtomicU64,
    pub sqs_messages_deleted: AtomicU64,
    pub sqs_messages_returned: AtomicU64,
    pub sqs_visibility_extensions: AtomicU64,
    pub sqs_messages_inflight: AtomicI64,
    pub s3_objects_requested: AtomicU64,
    pub s3_objects_listed: AtomicU64,
    pub s3_objects_processed: AtomicU64,
    pub s3_objects_failed: AtomicU64,
    pub s3_objects_inflight: AtomicI64,
    pub s3_events_created: AtomicU64,
    pub s3_bytes_processed: AtomicU64,
}

/// Point-in-time copy of [`InputMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub sqs_messages_received: u64,
    pub sqs_messages_deleted: u64,
    pub sqs_messages_returned: u64,
    pub sqs_visibility_extensions: u64,
    pub sqs_messages_inflight: i64,
    pub s3_objects_requested: u64,
    pub s3_objects_listed: u64,
    pub s3_objects_processed: u64,
    pub s3_objects_failed: u64,
    pub s3_objects_inflight: i64,
    pub s3_events_created: u64,
    pub s3_bytes_processed: u64,
}

impl InputMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Increments an in-flight gauge and returns a guard that decrements it.
    pub fn track(gauge: &AtomicI64) -> InflightGuard<'_> {
        gauge.fetch_add(1, Ordering::Relaxed);
        InflightGuard { gauge }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            sqs_messages_received: get(&self.sqs_messages_received),
            sqs_messages_deleted: get(&self.sqs_messages_deleted),
            sqs_messages_returned: get(&self.sqs_messages_returned),
            sqs_visibility_extensions: get(&self.sqs_visibility_extensions),
            sqs_messages_inflight: self.sqs_messages_inflight.load(Ordering::Relaxed),
            s3_objects_requested: get(&self.s3_objects_requested),
            s3_objects_listed: get(&self.s3_objects_listed),
            s3_objects_processed: get(&self.s3_objects_processed),
            s3_objects_failed: get(&self.s3_objects_failed),
            s3_objects_inflight: self.s3_objects_inflight.load(Ordering::Relaxed),
            s3_events_created: get(&self.s3_events_created),
            s3_bytes_processed: get(&self.s3_bytes_processed),
        }
    }
}

pub struct InflightGuard<'a> {
    gauge: &'a AtomicI64,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::Relaxed);
    }
}
