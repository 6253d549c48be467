//! Test helpers for s3feed integration tests
//!
//! In-memory fakes of the queue and object store APIs, plus builders for
//! the pieces a driver needs.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use s3feed::aws::{GetObjectOutput, ListedObject, ObjectPager, ObjectStoreApi, QueueApi, QueueMessage};
use s3feed::error::{ObjectStoreError, QueueError};
use s3feed::metrics::InputMetrics;
use s3feed::object::ObjectProcessorFactory;
use s3feed::pipeline::{AckingClient, ChannelSink, Record};
use s3feed::sync::FaultHandler;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn ts(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Default)]
pub struct FakeQueue {
    inbox: Mutex<VecDeque<QueueMessage>>,
    deleted: Mutex<Vec<String>>,
    visibility_changes: AtomicUsize,
}

impl FakeQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, msg: QueueMessage) {
        self.inbox.lock().unwrap().push_back(msg);
    }

    pub fn deletes(&self) -> usize {
        self.deleted.lock().unwrap().len()
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn visibility_changes(&self) -> usize {
        self.visibility_changes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueApi for FakeQueue {
    async fn receive_messages(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError> {
        let batch: Vec<_> = {
            let mut inbox = self.inbox.lock().unwrap();
            let n = max.min(inbox.len());
            inbox.drain(..n).collect()
        };
        if batch.is_empty() {
            // Long poll with nothing to deliver.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(batch)
    }

    async fn delete_message(&self, msg: &QueueMessage) -> Result<(), QueueError> {
        self.deleted.lock().unwrap().push(msg.message_id.clone());
        Ok(())
    }

    async fn change_message_visibility(
        &self,
        _msg: &QueueMessage,
        _timeout: Duration,
    ) -> Result<(), QueueError> {
        self.visibility_changes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn queue_message(id: &str, body: impl Into<String>, receive_count: Option<u32>) -> QueueMessage {
    QueueMessage {
        message_id: id.to_string(),
        receipt_handle: format!("receipt-{id}"),
        body: body.into(),
        receive_count,
    }
}

/// S3 `ObjectCreated:Put` notification body naming `keys` in `bucket`.
pub fn s3_notification(bucket: &str, keys: &[&str]) -> String {
    let records: Vec<_> = keys
        .iter()
        .map(|key| {
            serde_json::json!({
                "eventSource": "aws:s3",
                "awsRegion": "us-east-1",
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "bucket": { "name": bucket, "arn": format!("arn:aws:s3:::{bucket}") },
                    "object": { "key": key }
                }
            })
        })
        .collect();
    serde_json::json!({ "Records": records }).to_string()
}

// ============================================================================
// Object store
// ============================================================================

#[derive(Debug, Clone)]
pub struct FakeObject {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Default)]
pub struct FakeObjectStore {
    objects: Mutex<HashMap<String, FakeObject>>,
    failing: Mutex<HashMap<String, String>>,
    downloads: Mutex<HashMap<String, usize>>,
    list_failures: AtomicU32,
    page_size: AtomicUsize,
}

impl FakeObjectStore {
    pub fn new() -> Arc<Self> {
        let store = Self::default();
        store.page_size.store(1000, Ordering::SeqCst);
        Arc::new(store)
    }

    pub fn put(&self, key: &str, body: &str, etag: &str, last_modified: DateTime<Utc>) {
        self.put_object(
            key,
            FakeObject {
                body: body.as_bytes().to_vec(),
                content_type: Some("text/plain".to_string()),
                etag: etag.to_string(),
                last_modified,
            },
        );
    }

    pub fn put_object(&self, key: &str, object: FakeObject) {
        self.objects.lock().unwrap().insert(key.to_string(), object);
    }

    /// Every download of `key` fails with a request error.
    pub fn fail_downloads(&self, key: &str, reason: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert(key.to_string(), reason.to_string());
    }

    /// Downloads of `key` succeed again.
    pub fn restore_downloads(&self, key: &str) {
        self.failing.lock().unwrap().remove(key);
    }

    /// The next `n` listing calls fail.
    pub fn fail_listings(&self, n: u32) {
        self.list_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_page_size(&self, n: usize) {
        self.page_size.store(n.max(1), Ordering::SeqCst);
    }

    pub fn downloads(&self, key: &str) -> usize {
        self.downloads.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ObjectStoreApi for FakeObjectStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<GetObjectOutput, ObjectStoreError> {
        *self.downloads.lock().unwrap().entry(key.to_string()).or_insert(0) += 1;

        if let Some(reason) = self.failing.lock().unwrap().get(key) {
            return Err(ObjectStoreError::Request(reason.clone()));
        }
        let object = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
        Ok(GetObjectOutput {
            content_type: object.content_type,
            metadata: HashMap::new(),
            body: object.body,
        })
    }

    fn list_objects(
        &self,
        _bucket: &str,
        prefix: &str,
        start_after: Option<String>,
    ) -> Box<dyn ObjectPager> {
        let mut listed: Vec<ListedObject> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| start_after.as_deref().is_none_or(|after| key.as_str() > after))
            .map(|(key, obj)| ListedObject {
                key: key.clone(),
                etag: obj.etag.clone(),
                last_modified: obj.last_modified,
            })
            .collect();
        listed.sort_by(|a, b| a.key.cmp(&b.key));

        let page_size = self.page_size.load(Ordering::SeqCst);
        let pages: VecDeque<Vec<ListedObject>> =
            listed.chunks(page_size).map(<[ListedObject]>::to_vec).collect();
        let failures = self.list_failures.load(Ordering::SeqCst);
        self.list_failures.store(0, Ordering::SeqCst);
        Box::new(FakePager { pages, failures })
    }
}

pub struct FakePager {
    pages: VecDeque<Vec<ListedObject>>,
    failures: u32,
}

#[async_trait]
impl ObjectPager for FakePager {
    fn has_more_pages(&self) -> bool {
        !self.pages.is_empty()
    }

    async fn next_page(&mut self) -> Result<Vec<ListedObject>, ObjectStoreError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(ObjectStoreError::Request("listing unavailable".to_string()));
        }
        Ok(self.pages.pop_front().unwrap_or_default())
    }
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct Pipeline {
    pub client: Arc<AckingClient>,
    pub records: mpsc::Receiver<Record>,
    pub factory: Arc<ObjectProcessorFactory>,
    pub metrics: Arc<InputMetrics>,
    pub faults: FaultHandler,
}

/// Factory publishing into a channel whose records the test acknowledges.
pub fn pipeline(store: Arc<FakeObjectStore>, root: &CancellationToken) -> Pipeline {
    let faults = FaultHandler::new(root.clone());
    let (sink, records) = ChannelSink::new(64);
    let client = Arc::new(AckingClient::new(Arc::new(sink), faults.clone()));
    let metrics = Arc::new(InputMetrics::new());
    let factory = Arc::new(ObjectProcessorFactory::new(
        store,
        client.clone(),
        Vec::new(),
        metrics.clone(),
    ));
    Pipeline {
        client,
        records,
        factory,
        metrics,
        faults,
    }
}

/// Acknowledges every record as soon as it arrives. Returns the number of
/// records acknowledged so far.
pub fn spawn_auto_ack(
    mut records: mpsc::Receiver<Record>,
    client: Arc<AckingClient>,
) -> Arc<AtomicUsize> {
    let acked = Arc::new(AtomicUsize::new(0));
    let counter = acked.clone();
    tokio::spawn(async move {
        while records.recv().await.is_some() {
            client.acknowledge(1);
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    acked
}

/// Polls `condition` every few milliseconds until it holds, for at most 5s.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
