//! Narrow capability sets for the cloud APIs the drivers talk to.
//!
//! The drivers only see these traits; [`s3::S3ObjectStore`] is the
//! aws-sdk-s3 backed implementation, tests plug in in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{ObjectStoreError, QueueError};

pub mod s3;

pub use s3::{S3ClientConfig, S3ObjectStore};

const S3_ARN_PREFIX: &str = "arn:aws:s3:::";

/// Bucket name from an ARN (`arn:aws:s3:::name`); plain names pass through.
pub fn bucket_name_from_arn(bucket: &str) -> &str {
    bucket.strip_prefix(S3_ARN_PREFIX).unwrap_or(bucket)
}

/// ARN for a bucket name; values already in ARN form pass through.
pub fn bucket_arn(bucket: &str) -> String {
    if bucket.starts_with("arn:") {
        bucket.to_string()
    } else {
        format!("{S3_ARN_PREFIX}{bucket}")
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetObjectOutput {
    pub content_type: Option<String>,
    /// User metadata as returned by the store, keys without the `x-amz-meta-` prefix.
    pub metadata: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    pub key: String,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

/// One listing, consumed page by page.
#[async_trait]
pub trait ObjectPager: Send {
    fn has_more_pages(&self) -> bool;

    async fn next_page(&mut self) -> Result<Vec<ListedObject>, ObjectStoreError>;
}

#[async_trait]
pub trait ObjectStoreApi: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str)
        -> Result<GetObjectOutput, ObjectStoreError>;

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        start_after: Option<String>,
    ) -> Box<dyn ObjectPager>;
}

/// A received queue message. Only the receipt handle is used to act on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    /// `ApproximateReceiveCount` attribute, when the queue reported it.
    pub receive_count: Option<u32>,
}

#[async_trait]
pub trait QueueApi: Send + Sync {
    async fn receive_messages(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError>;

    async fn delete_message(&self, msg: &QueueMessage) -> Result<(), QueueError>;

    async fn change_message_visibility(
        &self,
        msg: &QueueMessage,
        timeout: Duration,
    ) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_name_and_arn_conversions() {
        assert_eq!(bucket_name_from_arn("arn:aws:s3:::logs"), "logs");
        assert_eq!(bucket_name_from_arn("logs"), "logs");
        assert_eq!(bucket_arn("logs"), "arn:aws:s3:::logs");
        assert_eq!(bucket_arn("arn:aws:s3:::logs"), "arn:aws:s3:::logs");
    }
}
