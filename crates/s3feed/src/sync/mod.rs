//! Concurrency primitives shared by the queue and bucket drivers

pub mod fault;
pub mod semaphore;

pub use fault::FaultHandler;
pub use semaphore::{AcquireCancelled, CountingSemaphore};
