//! Per-object processing: download, decompress, decode, publish.
//!
//! The factory picks a reader configuration by matching the object key
//! against the configured file selectors. A processor is single use: call
//! [`ObjectProcessor::process`] once, then [`ObjectProcessor::wait`] for the
//! downstream acknowledgments of everything it published.

pub mod compression;
pub mod decoder;

use chrono::Utc;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use s3feed_common::identity::{object_hash, record_id};

use crate::ack::EventAckTracker;
use crate::aws::{GetObjectOutput, ObjectStoreApi};
use crate::error::{ObjectStoreError, ProcessError};
use crate::metrics::InputMetrics;
use crate::pipeline::{Client, Record};

pub use decoder::{
    DecodedRecord, JsonDecoder, LineDecoder, LineTerminator, RecordDecoder, ROOT_ARRAY,
};

/// Prefix of user-defined metadata headers.
const USER_META_PREFIX: &str = "x-amz-meta-";

/// Reference to one object, as named by a notification or a listing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectRef {
    pub bucket_name: String,
    pub bucket_arn: String,
    pub key: String,
    pub region: String,
    pub provider: String,
}

impl ObjectRef {
    pub fn new(bucket_name: impl Into<String>, bucket_arn: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            bucket_arn: bucket_arn.into(),
            key: key.into(),
            region: String::new(),
            provider: "aws".to_string(),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Virtual-hosted style URL used as `log.file.path`.
    pub fn request_url(&self) -> String {
        if self.region.is_empty() {
            format!("https://{}.s3.amazonaws.com/{}", self.bucket_name, self.key)
        } else {
            format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket_name, self.region, self.key
            )
        }
    }
}

/// How records are read from the objects a selector matches.
#[derive(Debug, Clone, Default)]
pub struct ReaderConfig {
    /// Overrides the content type reported by the object store.
    pub content_type: Option<String>,
    pub expand_event_list_from_field: Option<String>,
    /// Lower-cased metadata keys copied into `aws.s3.metadata`.
    pub include_s3_metadata: Vec<String>,
    pub line_terminator: LineTerminator,
    /// Replaces the built-in decoders when set.
    pub decoder: Option<Arc<dyn RecordDecoder>>,
}

#[derive(Debug, Clone)]
pub struct FileSelector {
    /// `None` matches every key.
    pub regex: Option<Regex>,
    pub reader: ReaderConfig,
}

impl FileSelector {
    pub fn match_all(reader: ReaderConfig) -> Self {
        Self {
            regex: None,
            reader,
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.as_ref().is_none_or(|re| re.is_match(key))
    }
}

pub struct ObjectProcessorFactory {
    store: Arc<dyn ObjectStoreApi>,
    client: Arc<dyn Client>,
    selectors: Vec<FileSelector>,
    metrics: Arc<InputMetrics>,
}

impl ObjectProcessorFactory {
    /// With no selectors every object is read with the default reader.
    pub fn new(
        store: Arc<dyn ObjectStoreApi>,
        client: Arc<dyn Client>,
        mut selectors: Vec<FileSelector>,
        metrics: Arc<InputMetrics>,
    ) -> Self {
        if selectors.is_empty() {
            selectors.push(FileSelector::match_all(ReaderConfig::default()));
        }
        Self {
            store,
            client,
            selectors,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<InputMetrics> {
        &self.metrics
    }

    fn find_reader_config(&self, key: &str) -> Option<&ReaderConfig> {
        self.selectors
            .iter()
            .find(|sel| sel.matches(key))
            .map(|sel| &sel.reader)
    }

    /// Builds a processor for `obj`, or `None` when no selector matches its key.
    pub fn create(&self, obj: ObjectRef, cancel: CancellationToken) -> Option<ObjectProcessor> {
        let Some(reader) = self.find_reader_config(&obj.key) else {
            debug!(bucket = %obj.bucket_name, object_key = %obj.key, "no file selector matches object; skipping");
            return None;
        };

        Some(ObjectProcessor {
            hash: object_hash(&obj.bucket_arn, &obj.key),
            request_url: obj.request_url(),
            obj,
            reader: reader.clone(),
            store: self.store.clone(),
            client: self.client.clone(),
            metrics: self.metrics.clone(),
            ack: Arc::new(EventAckTracker::new()),
            cancel,
            published: 0,
        })
    }
}

pub struct ObjectProcessor {
    obj: ObjectRef,
    hash: String,
    request_url: String,
    reader: ReaderConfig,
    store: Arc<dyn ObjectStoreApi>,
    client: Arc<dyn Client>,
    metrics: Arc<InputMetrics>,
    ack: Arc<EventAckTracker>,
    cancel: CancellationToken,
    published: u64,
}

impl ObjectProcessor {
    pub fn object(&self) -> &ObjectRef {
        &self.obj
    }

    pub fn ack_tracker(&self) -> &Arc<EventAckTracker> {
        &self.ack
    }

    /// Downloads and publishes the object. Returns the number of records
    /// published. Records published before an error keep their acks.
    pub async fn process(&mut self) -> Result<u64, ProcessError> {
        debug!(bucket = %self.obj.bucket_name, object_key = %self.obj.key, "begin object processing");
        let metrics = self.metrics.clone();
        InputMetrics::incr(&metrics.s3_objects_requested);
        let _inflight = InputMetrics::track(&metrics.s3_objects_inflight);
        let start = Instant::now();

        let result = self.process_inner().await;
        debug!(
            object_key = %self.obj.key,
            elapsed_ms = start.elapsed().as_millis() as u64,
            published = self.published,
            "end object processing"
        );
        result
    }

    async fn process_inner(&mut self) -> Result<u64, ProcessError> {
        let output = match self.download().await {
            Ok(output) => output,
            Err(ObjectStoreError::NotFound { bucket, key }) => {
                warn!(bucket = %bucket, object_key = %key, "object no longer exists; nothing to read");
                return Ok(0);
            }
            Err(ObjectStoreError::Cancelled) => return Err(ProcessError::Cancelled),
            Err(source) => {
                return Err(ProcessError::Download {
                    bucket: self.obj.bucket_name.clone(),
                    key: self.obj.key.clone(),
                    source,
                })
            }
        };

        InputMetrics::add(&self.metrics.s3_bytes_processed, output.body.len() as u64);
        let body = compression::maybe_decompress(&output.body).map_err(ProcessError::Decompress)?;

        let content_type = self
            .reader
            .content_type
            .clone()
            .or_else(|| output.content_type.clone())
            .unwrap_or_default();

        let decoder: Arc<dyn RecordDecoder> = match &self.reader.decoder {
            Some(custom) => custom.clone(),
            None if decoder::is_json_content_type(&content_type) => Arc::new(JsonDecoder::new(
                self.reader.expand_event_list_from_field.clone(),
            )),
            None => Arc::new(LineDecoder::new(self.reader.line_terminator)),
        };

        let mut decoded = Vec::new();
        let decode_result = decoder.decode(&body, &mut decoded);
        let metadata = select_metadata(&output, &self.reader.include_s3_metadata);

        for record in decoded {
            if self.cancel.is_cancelled() {
                return Err(ProcessError::Cancelled);
            }
            let record = self.create_record(record, metadata.as_ref());
            self.ack.add();
            self.client.publish(record).await?;
            self.published += 1;
            InputMetrics::incr(&self.metrics.s3_events_created);
        }

        decode_result?;
        Ok(self.published)
    }

    async fn download(&self) -> Result<GetObjectOutput, ObjectStoreError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ObjectStoreError::Cancelled),
            output = self.store.get_object(&self.obj.bucket_name, &self.obj.key) => output,
        }
    }

    fn create_record(&self, decoded: DecodedRecord, metadata: Option<&Map<String, Value>>) -> Record {
        let mut fields = json!({
            "message": decoded.message,
            "log": {
                "offset": decoded.offset,
                "file": { "path": self.request_url },
            },
            "aws": {
                "s3": {
                    "bucket": { "name": self.obj.bucket_name, "arn": self.obj.bucket_arn },
                    "object": { "key": self.obj.key },
                },
            },
            "cloud": { "provider": self.obj.provider, "region": self.obj.region },
        });

        if let Some(metadata) = metadata {
            fields["aws"]["s3"]["metadata"] = Value::Object(metadata.clone());
        }
        if let (Some(extra), Value::Object(target)) = (decoded.fields, &mut fields) {
            for (k, v) in extra {
                target.insert(k, v);
            }
        }

        Record {
            id: record_id(&self.hash, decoded.offset),
            timestamp: Utc::now(),
            message: decoded.message,
            fields,
            ack: self.ack.clone(),
        }
    }

    /// Waits until every published record was acknowledged downstream.
    pub async fn wait(&self) -> Result<(), ProcessError> {
        self.ack.wait(&self.cancel).await
    }
}

/// Metadata selected by `include_s3_metadata`. User metadata is addressed by
/// its full header name (`x-amz-meta-*`).
fn select_metadata(output: &GetObjectOutput, keys: &[String]) -> Option<Map<String, Value>> {
    if keys.is_empty() {
        return None;
    }

    let mut all: HashMap<String, &str> = output
        .metadata
        .iter()
        .map(|(k, v)| (format!("{USER_META_PREFIX}{}", k.to_lowercase()), v.as_str()))
        .collect();
    if let Some(content_type) = &output.content_type {
        all.insert("content-type".to_string(), content_type.as_str());
    }

    let selected: Map<String, Value> = keys
        .iter()
        .filter_map(|key| {
            let key = key.to_lowercase();
            all.get(&key).map(|v| (key, Value::String(v.to_string())))
        })
        .collect();

    (!selected.is_empty()).then_some(selected)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_select_metadata_uses_full_header_names() {
        let output = GetObjectOutput {
            content_type: Some("text/plain".to_string()),
            metadata: HashMap::from([("Owner".to_string(), "team-a".to_string())]),
            body: Vec::new(),
        };
        let keys = vec!["x-amz-meta-owner".to_string(), "Content-Type".to_string(), "etag".to_string()];
        let selected = select_metadata(&output, &keys).unwrap();
        assert_eq!(selected["x-amz-meta-owner"], "team-a");
        assert_eq!(selected["content-type"], "text/plain");
        assert!(!selected.contains_key("etag"));

        assert!(select_metadata(&output, &[]).is_none());
    }

    #[test]
    fn test_request_url() {
        let obj = ObjectRef::new("logs", "arn:aws:s3:::logs", "a/b.log").with_region("eu-west-1");
        assert_eq!(obj.request_url(), "https://logs.s3.eu-west-1.amazonaws.com/a/b.log");
    }

    #[test]
    fn test_selector_without_regex_matches_everything() {
        let sel = FileSelector::match_all(ReaderConfig::default());
        assert!(sel.matches("anything"));
        let sel = FileSelector {
            regex: Some(Regex::new(r"\.json$").unwrap()),
            reader: ReaderConfig::default(),
        };
        assert!(sel.matches("a.json"));
        assert!(!sel.matches("a.log"));
    }
}
