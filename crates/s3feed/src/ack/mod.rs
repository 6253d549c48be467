//! Acknowledgment bookkeeping between the publish sink and the drivers

pub mod gap;
pub mod tracker;

pub use gap::{AckBatch, AckGapTracker};
pub use tracker::EventAckTracker;
