//! Publish side of the ingestion core.
//!
//! Object processors hand [`Record`]s to a [`Client`]. The bundled
//! [`AckingClient`] forwards them to a [`RecordSink`] and turns the sink's
//! in-order acknowledgments back into per-record acks on each record's
//! [`EventAckTracker`], folding in records it dropped on the way.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ack::{AckGapTracker, EventAckTracker};
use crate::error::PublishError;
use crate::sync::FaultHandler;

/// One discrete event derived from an object.
#[derive(Debug, Clone)]
pub struct Record {
    /// Stable dedup id, `{hash}-{offset:012}`.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    /// Structured fields (`log.offset`, `aws.s3.*`, `cloud.*`, ...).
    pub fields: Value,
    /// Ack correlation handle of the unit of work this record came from.
    pub ack: Arc<EventAckTracker>,
}

impl Record {
    /// Flattens the record into the JSON document written by outputs.
    pub fn to_document(&self) -> Value {
        let mut doc = match &self.fields {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("fields".to_string(), other.clone());
                map
            }
        };
        doc.insert("@timestamp".to_string(), json!(self.timestamp.to_rfc3339()));
        doc.insert("_id".to_string(), json!(self.id));
        doc.entry("message".to_string())
            .or_insert_with(|| json!(self.message));
        Value::Object(doc)
    }
}

/// Opaque downstream publisher.
#[async_trait]
pub trait Client: Send + Sync {
    async fn publish(&self, record: Record) -> Result<(), PublishError>;
}

/// Where an [`AckingClient`] delivers the records it keeps.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn deliver(&self, record: Record) -> Result<(), PublishError>;
}

/// Bounded channel into an output task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Record>,
}

impl ChannelSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Record>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RecordSink for ChannelSink {
    async fn deliver(&self, record: Record) -> Result<(), PublishError> {
        self.tx
            .send(record)
            .await
            .map_err(|_| PublishError("output channel closed".to_string()))
    }
}

/// Returns `true` for records that must be dropped instead of delivered.
pub type DropFilter = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// Publish client that reconciles sink acknowledgments with dropped records.
pub struct AckingClient {
    sink: Arc<dyn RecordSink>,
    gap: AckGapTracker,
    /// Ack handles of sent and gap-recorded dropped records, in publish order.
    pending: Mutex<VecDeque<Arc<EventAckTracker>>>,
    /// Held from recording a send until the sink accepted the record. The
    /// sink acknowledges in delivery order, so `pending` must be in delivery
    /// order too; releasing before `deliver` would let a later publish
    /// overtake an earlier one and have its handle released by the wrong ack.
    publish_serial: tokio::sync::Mutex<()>,
    drop_filter: Option<DropFilter>,
    faults: FaultHandler,
}

impl AckingClient {
    pub fn new(sink: Arc<dyn RecordSink>, faults: FaultHandler) -> Self {
        Self {
            sink,
            gap: AckGapTracker::new(),
            pending: Mutex::new(VecDeque::new()),
            publish_serial: tokio::sync::Mutex::new(()),
            drop_filter: None,
            faults,
        }
    }

    pub fn with_drop_filter(mut self, filter: DropFilter) -> Self {
        self.drop_filter = Some(filter);
        self
    }

    /// Sent records the sink has not acknowledged yet.
    pub fn outstanding(&self) -> u64 {
        self.gap.outstanding()
    }

    /// Called by the sink side: the next `n` delivered records were accepted.
    pub fn acknowledge(&self, n: u64) {
        match self.gap.acknowledge(n) {
            Ok(batch) => {
                tracing::trace!(acked = batch.acked, total = batch.total, "acknowledged batch");
                let released: Vec<_> = {
                    let mut pending = self.lock_pending();
                    let take = usize::try_from(batch.total)
                        .unwrap_or(usize::MAX)
                        .min(pending.len());
                    pending.drain(..take).collect()
                };
                for handle in released {
                    self.ack_handle(&handle);
                }
            }
            Err(fault) => self.faults.trigger("publish acknowledge", fault),
        }
    }

    fn ack_handle(&self, handle: &EventAckTracker) {
        if let Err(fault) = handle.ack() {
            self.faults.trigger("record ack", fault);
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<EventAckTracker>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Client for AckingClient {
    /// Publishes are serialized through `deliver`: a publisher waiting on a
    /// full sink blocks the next one.
    async fn publish(&self, record: Record) -> Result<(), PublishError> {
        let _serial = self.publish_serial.lock().await;

        let dropped = self.drop_filter.as_ref().is_some_and(|f| f(&record));
        if dropped {
            let immediate = {
                let mut pending = self.lock_pending();
                let immediate = self.gap.record_dropped();
                if immediate.is_none() {
                    pending.push_back(record.ack.clone());
                }
                immediate
            };
            tracing::debug!(record_id = %record.id, "record dropped by filter");
            if immediate.is_some() {
                self.ack_handle(&record.ack);
            }
            return Ok(());
        }

        {
            let mut pending = self.lock_pending();
            pending.push_back(record.ack.clone());
            self.gap.record_sent();
        }
        self.sink.deliver(record).await
    }
}

/// Writes records as JSON lines and acknowledges each one after the write.
pub async fn run_json_output<W>(
    mut rx: mpsc::Receiver<Record>,
    mut writer: W,
    client: Arc<AckingClient>,
    cancel: CancellationToken,
) -> std::io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    loop {
        let record = tokio::select! {
            _ = cancel.cancelled() => break,
            record = rx.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };

        let mut line = serde_json::to_vec(&record.to_document())?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
        written += 1;
        client.acknowledge(1);
    }
    Ok(written)
}
