//! Queue-driven ingestion: receive notifications, process the objects they
//! name, and settle each message with the queue.

pub mod message;
pub mod notification;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::aws::QueueApi;
use crate::error::QueueError;
use crate::metrics::InputMetrics;
use crate::sync::CountingSemaphore;

pub use message::{classify, Disposition, MessageHandler, ObjectFailure};
pub use notification::{NotificationParser, NotificationPreParser};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub struct SqsReader {
    queue: Arc<dyn QueueApi>,
    handler: Arc<MessageHandler>,
    workers: Arc<CountingSemaphore>,
    max_messages: usize,
    metrics: Arc<InputMetrics>,
}

impl SqsReader {
    /// `max_messages` bounds both in-flight messages and one receive call.
    pub fn new(
        queue: Arc<dyn QueueApi>,
        handler: Arc<MessageHandler>,
        max_messages: usize,
        metrics: Arc<InputMetrics>,
    ) -> Self {
        let max_messages = max_messages.max(1);
        Self {
            queue,
            handler,
            workers: Arc::new(CountingSemaphore::new(max_messages)),
            max_messages,
            metrics,
        }
    }

    /// Receives and handles messages until `cancel` fires, then waits for
    /// the in-flight handlers to abandon their messages.
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, cancel: CancellationToken) {
        info!(max_messages = self.max_messages, "queue reader started");
        let mut handlers = JoinSet::new();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            while let Some(joined) = handlers.try_join_next() {
                if let Err(e) = joined {
                    warn!(error = %e, "message handler task failed");
                }
            }

            let Ok(granted) = self
                .workers
                .acquire_with_cancel(self.max_messages, &cancel)
                .await
            else {
                break;
            };

            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(QueueError::Cancelled),
                received = self.queue.receive_messages(granted) => received,
            };

            let messages = match received {
                Ok(messages) => {
                    backoff = INITIAL_BACKOFF;
                    messages
                }
                Err(QueueError::Cancelled) => {
                    self.workers.release(granted);
                    break;
                }
                Err(e) => {
                    self.workers.release(granted);
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "failed to receive messages");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            let unused = granted.saturating_sub(messages.len());
            if unused > 0 {
                self.workers.release(unused);
            }
            if messages.is_empty() {
                continue;
            }

            InputMetrics::add(&self.metrics.sqs_messages_received, messages.len() as u64);
            debug!(count = messages.len(), "received messages");

            for msg in messages {
                let handler = self.handler.clone();
                let workers = self.workers.clone();
                let cancel = cancel.clone();
                handlers.spawn(async move {
                    handler.handle(msg, &cancel).await;
                    workers.release(1);
                });
            }
        }

        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "message handler task failed");
            }
        }
        info!("queue reader stopped");
    }
}
