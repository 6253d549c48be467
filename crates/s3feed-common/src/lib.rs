//! s3feed Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared logging and identity helpers for the s3feed workspace.
//!
//! # Overview
//!
//! - **Logging**: subscriber setup and a throttle for repeated failures
//! - **Identity**: stable hashes and per-record ids derived from object identity
//!
//! # Example
//!
//! ```
//! use s3feed_common::identity::{object_hash, record_id};
//!
//! let hash = object_hash("arn:aws:s3:::logs", "2024/01/01/app.log.gz");
//! assert_eq!(hash.len(), 10);
//! assert!(record_id(&hash, 42).ends_with("-000000000042"));
//! ```

pub mod identity;
pub mod logging;
