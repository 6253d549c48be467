//! Error taxonomy for the ingestion core
//!
//! Operational errors are split by what the drivers do with them:
//! retryable errors leave the unit of work for redelivery or the next poll
//! cycle, non-retryable errors finalize it as failed. [`Fault`] is separate on
//! purpose: it reports a broken invariant and is never retried.

use thiserror::Error;

/// Invariant violations. These indicate a logic bug, not an environment
/// condition, and are surfaced immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("acknowledged {acked} events but only {outstanding} were sent")]
    OverAcknowledged { acked: u64, outstanding: u64 },

    #[error("event ack received with no pending events")]
    NegativePending,
}

/// Errors returned by the object store capability set.
#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("object s3://{bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("object store request failed: {0}")]
    Request(String),
}

/// Errors returned by the queue capability set.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("request cancelled")]
    Cancelled,

    #[error("queue request failed: {0}")]
    Request(String),
}

/// Raised when a record cannot be handed to the output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("publish sink closed: {0}")]
pub struct PublishError(pub String);

/// Errors raised while turning one object into records.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to download s3://{bucket}/{key}: {source}")]
    Download {
        bucket: String,
        key: String,
        #[source]
        source: ObjectStoreError,
    },

    #[error("failed to decompress object: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("failed to decode object: {0}")]
    Decode(String),

    #[error("failed to publish record: {0}")]
    Publish(#[from] PublishError),

    #[error("processing cancelled")]
    Cancelled,

    #[error(transparent)]
    Fault(#[from] Fault),
}

impl ProcessError {
    /// Transient failures: the unit of work is left to be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessError::Download { .. })
    }
}

/// Errors raised while decoding a queue notification.
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("notification body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("notification envelope message could not be decoded: {0}")]
    Envelope(String),

    #[error("object key '{key}' could not be unescaped: {reason}")]
    Unescape { key: String, reason: String },

    #[error("pre-parser failed: {0}")]
    PreParser(String),
}

/// Errors raised by the persistent state store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("state key '{key}' does not carry prefix '{prefix}'")]
    ForeignPrefix { key: String, prefix: String },
}
