//! Processing of a single queue message, from parse to disposition.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use s3feed_common::logging::LogThrottle;

use crate::aws::{QueueApi, QueueMessage};
use crate::error::{ProcessError, QueueError};
use crate::metrics::InputMetrics;
use crate::object::{ObjectProcessorFactory, ObjectRef};
use crate::sync::FaultHandler;

use super::notification::NotificationParser;

/// What happens to a message once its processing finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Every referenced object was fully acknowledged.
    Delete,
    /// Nothing to retry toward: malformed body or non-retryable failure.
    DeleteNonRetryable,
    /// Retryable failure that exceeded the receive count.
    DeletePoison,
    /// Retryable failure: the visibility timeout redelivers the message.
    Leave,
    /// Shutdown or fault while in flight: no finalize action.
    Abandon,
}

impl Disposition {
    pub fn deletes(self) -> bool {
        matches!(
            self,
            Disposition::Delete | Disposition::DeleteNonRetryable | Disposition::DeletePoison
        )
    }
}

/// Per-object failure, attributed to the object it happened on.
#[derive(Debug)]
pub struct ObjectFailure {
    pub object: ObjectRef,
    pub error: ProcessError,
}

/// Decides the disposition of a message from the failures of its objects.
///
/// A retryable failure wins over non-retryable ones so the retryable object
/// gets another attempt, unless the message was already received
/// `max_receive_count` times (0 disables the limit).
pub fn classify(
    failures: &[ObjectFailure],
    receive_count: Option<u32>,
    max_receive_count: u32,
) -> Disposition {
    if failures.is_empty() {
        return Disposition::Delete;
    }
    if failures
        .iter()
        .any(|f| matches!(f.error, ProcessError::Cancelled | ProcessError::Fault(_)))
    {
        return Disposition::Abandon;
    }
    if failures.iter().any(|f| f.error.is_retryable()) {
        let exhausted = max_receive_count > 0
            && receive_count.is_some_and(|count| count >= max_receive_count);
        return if exhausted {
            Disposition::DeletePoison
        } else {
            Disposition::Leave
        };
    }
    Disposition::DeleteNonRetryable
}

pub struct MessageHandler {
    queue: Arc<dyn QueueApi>,
    factory: Arc<ObjectProcessorFactory>,
    parser: NotificationParser,
    visibility_timeout: Duration,
    max_receive_count: u32,
    metrics: Arc<InputMetrics>,
    faults: FaultHandler,
    throttle: Arc<LogThrottle>,
}

impl MessageHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn QueueApi>,
        factory: Arc<ObjectProcessorFactory>,
        parser: NotificationParser,
        visibility_timeout: Duration,
        max_receive_count: u32,
        metrics: Arc<InputMetrics>,
        faults: FaultHandler,
        throttle: Arc<LogThrottle>,
    ) -> Self {
        Self {
            queue,
            factory,
            parser,
            visibility_timeout,
            max_receive_count,
            metrics,
            faults,
            throttle,
        }
    }

    pub async fn handle(&self, msg: QueueMessage, cancel: &CancellationToken) -> Disposition {
        let _inflight = InputMetrics::track(&self.metrics.sqs_messages_inflight);

        let refs = match self.parser.parse(&msg.body) {
            Ok(refs) => refs,
            Err(e) => {
                let cause = format!("notification parse: {e}");
                if self.throttle.allow(&cause) {
                    error!(message_id = %msg.message_id, error = %e, "failed to decode queue message; deleting it");
                }
                return self.finalize(&msg, Disposition::DeleteNonRetryable, cancel).await;
            }
        };

        if refs.is_empty() {
            debug!(message_id = %msg.message_id, "message references no objects; deleting it");
            return self.finalize(&msg, Disposition::Delete, cancel).await;
        }

        let keepalive_cancel = cancel.child_token();
        let keepalive = tokio::spawn(keep_visible(
            self.queue.clone(),
            msg.clone(),
            self.visibility_timeout,
            keepalive_cancel.clone(),
            self.metrics.clone(),
        ));

        let failures = self.process_objects(refs, cancel).await;

        // Stop extending visibility before deciding, so no extension races the delete.
        keepalive_cancel.cancel();
        if let Err(e) = keepalive.await {
            warn!(message_id = %msg.message_id, error = %e, "visibility keepalive task failed");
        }

        for failure in &failures {
            if let ProcessError::Fault(fault) = &failure.error {
                self.faults.trigger("object processing", fault.clone());
            }
        }

        let disposition = if cancel.is_cancelled() {
            Disposition::Abandon
        } else {
            classify(&failures, msg.receive_count, self.max_receive_count)
        };
        self.log_failures(&msg, &failures, disposition);
        self.finalize(&msg, disposition, cancel).await
    }

    async fn process_objects(
        &self,
        refs: Vec<ObjectRef>,
        cancel: &CancellationToken,
    ) -> Vec<ObjectFailure> {
        let mut failures = Vec::new();
        for obj in refs {
            if cancel.is_cancelled() {
                failures.push(ObjectFailure {
                    object: obj,
                    error: ProcessError::Cancelled,
                });
                break;
            }

            let Some(mut processor) = self.factory.create(obj, cancel.child_token()) else {
                continue;
            };

            let result = match processor.process().await {
                Ok(_) => processor.wait().await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => InputMetrics::incr(&self.metrics.s3_objects_processed),
                Err(error) => {
                    if !matches!(error, ProcessError::Cancelled) {
                        InputMetrics::incr(&self.metrics.s3_objects_failed);
                    }
                    failures.push(ObjectFailure {
                        object: processor.object().clone(),
                        error,
                    });
                }
            }
        }
        failures
    }

    fn log_failures(&self, msg: &QueueMessage, failures: &[ObjectFailure], disposition: Disposition) {
        for failure in failures {
            if matches!(failure.error, ProcessError::Cancelled) {
                continue;
            }
            let cause = format!("{}: {}", failure.object.key, failure.error);
            if failure.error.is_retryable() && disposition == Disposition::Leave {
                warn!(
                    message_id = %msg.message_id,
                    bucket = %failure.object.bucket_name,
                    object_key = %failure.object.key,
                    error = %failure.error,
                    "retryable object failure; message left for redelivery"
                );
            } else if self.throttle.allow(&cause) {
                error!(
                    message_id = %msg.message_id,
                    bucket = %failure.object.bucket_name,
                    object_key = %failure.object.key,
                    error = %failure.error,
                    ?disposition,
                    "object processing failed"
                );
            }
        }
    }

    async fn finalize(
        &self,
        msg: &QueueMessage,
        disposition: Disposition,
        cancel: &CancellationToken,
    ) -> Disposition {
        if !disposition.deletes() {
            InputMetrics::incr(&self.metrics.sqs_messages_returned);
            return disposition;
        }
        if cancel.is_cancelled() {
            InputMetrics::incr(&self.metrics.sqs_messages_returned);
            return Disposition::Abandon;
        }

        if disposition == Disposition::DeletePoison {
            warn!(
                message_id = %msg.message_id,
                receive_count = ?msg.receive_count,
                max_receive_count = self.max_receive_count,
                "message exceeded the receive count; deleting it"
            );
        }

        match self.queue.delete_message(msg).await {
            Ok(()) => {
                InputMetrics::incr(&self.metrics.sqs_messages_deleted);
                debug!(message_id = %msg.message_id, ?disposition, "deleted message");
            }
            Err(e) => {
                InputMetrics::incr(&self.metrics.sqs_messages_returned);
                error!(message_id = %msg.message_id, error = %e, "failed to delete message");
            }
        }
        disposition
    }
}

/// Extends the message visibility every half timeout until cancelled.
async fn keep_visible(
    queue: Arc<dyn QueueApi>,
    msg: QueueMessage,
    visibility_timeout: Duration,
    cancel: CancellationToken,
    metrics: Arc<InputMetrics>,
) {
    let period = (visibility_timeout / 2).max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match queue.change_message_visibility(&msg, visibility_timeout).await {
            Ok(()) => {
                InputMetrics::incr(&metrics.sqs_visibility_extensions);
                info!(
                    message_id = %msg.message_id,
                    visibility_timeout_secs = visibility_timeout.as_secs(),
                    "message visibility timeout extended"
                );
            }
            Err(QueueError::Cancelled) => return,
            Err(e) => error!(message_id = %msg.message_id, error = %e, "failed to extend message visibility"),
        }
    }
}
