//! s3feed Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Ingests objects stored in an S3 bucket as records for a downstream
//! pipeline, with at-least-once delivery.
//!
//! # Overview
//!
//! Objects are discovered by one of two drivers:
//!
//! - **Queue driver** ([`sqs`]): S3 event notifications received from a
//!   queue. A message is deleted only once every record of every object it
//!   names was acknowledged downstream.
//! - **Polling driver** ([`poller`]): periodic listing of a bucket, with a
//!   persisted [`state`] registry so objects are processed once.
//!
//! Both hand objects to the [`object`] processor, which downloads,
//! decompresses, decodes and publishes records through a [`pipeline`]
//! client. Acknowledgments flow back through the [`ack`] trackers.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use s3feed::ack::EventAckTracker;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), s3feed::error::ProcessError> {
//! let tracker = Arc::new(EventAckTracker::new());
//! tracker.add();
//! tracker.ack()?;
//! tracker.wait(&CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod ack;
pub mod aws;
pub mod config;
pub mod error;
pub mod metrics;
pub mod object;
pub mod pipeline;
pub mod poller;
pub mod sqs;
pub mod state;
pub mod sync;

pub use config::{Cli, Config};
pub use error::{Fault, ProcessError};
