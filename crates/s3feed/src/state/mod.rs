//! Per-object processing state and its persistence

pub mod registry;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use registry::{FlushReport, RegistryMode, StateRegistry};
pub use store::{FileStore, MemoryStore, StateStore};

/// Store key prefix of object states.
pub const STATE_KEY_PREFIX: &str = "s3feed::state::";
/// Store key of the lexicographic listing tail.
pub const TAIL_KEY: &str = "s3feed::tail";
/// Store key of the lexicographic keys awaiting another attempt.
pub const UNRESOLVED_KEY: &str = "s3feed::unresolved";
/// Store key prefix of the per-bucket committed watermark.
pub const WATERMARK_KEY_PREFIX: &str = "s3feed::watermark::";

pub fn state_store_key(id: &str) -> String {
    format!("{STATE_KEY_PREFIX}{id}")
}

pub fn watermark_store_key(bucket: &str) -> String {
    format!("{WATERMARK_KEY_PREFIX}{bucket}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectState {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub stored: bool,
    #[serde(default)]
    pub failed: bool,
}

impl ObjectState {
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        etag: impl Into<String>,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            etag: etag.into(),
            last_modified,
            stored: false,
            failed: false,
        }
    }

    /// Dedup identity: a changed etag or modification time is a new object.
    pub fn id(&self) -> String {
        format!(
            "{}{}{}{}",
            self.bucket,
            self.key,
            self.etag,
            self.last_modified.timestamp_nanos_opt().unwrap_or_default()
        )
    }

    /// Identity that sorts by object key first.
    pub fn lexicographic_id(&self) -> String {
        format!("{}|{}", self.key, self.id())
    }

    /// Whether `other` names the same object in the same bucket.
    pub fn same_object(&self, other: &ObjectState) -> bool {
        self.bucket == other.bucket && self.key == other.key
    }

    pub fn is_terminal(&self) -> bool {
        self.stored || self.failed
    }

    pub fn mark_stored(&mut self) {
        self.stored = true;
        self.failed = false;
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
        self.stored = false;
    }
}
