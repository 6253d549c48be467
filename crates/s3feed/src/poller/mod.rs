//! Polling ingestion: periodically list a bucket and process new objects.
//!
//! Each scan walks the listing page by page. Objects that are neither
//! already processed nor rejected by a filter are dispatched to a bounded
//! worker pool. A page holds its purge lock until every dispatched object
//! reached a terminal outcome; the worker resolving the last one flushes the
//! registry for the bucket.

pub mod breaker;
pub mod filter;
pub mod listing;
pub mod strategy;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use s3feed_common::logging::LogThrottle;

use crate::aws::ObjectStoreApi;
use crate::error::{ObjectStoreError, ProcessError};
use crate::metrics::InputMetrics;
use crate::object::{ObjectProcessor, ObjectProcessorFactory, ObjectRef};
use crate::state::{ObjectState, StateRegistry};
use crate::sync::{CountingSemaphore, FaultHandler};

pub use breaker::CircuitBreaker;
pub use filter::{FilterChain, IgnoreOlder, ObjectFilter, StartTimestamp};
pub use listing::ListingPage;
pub use strategy::PollingStrategy;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub bucket_name: String,
    pub bucket_arn: String,
    pub region: String,
    pub list_prefix: String,
    pub interval: Duration,
    pub number_of_workers: usize,
    pub ignore_older: Option<Duration>,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub strategy: PollingStrategy,
}

/// Outcome of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub listed: usize,
    pub dispatched: usize,
    pub skipped: usize,
    /// False when the scan was abandoned or cancelled before the listing ended.
    pub complete: bool,
}

/// State shared between the poller and its workers.
struct WorkerContext {
    bucket: String,
    ignore_older: Option<Duration>,
    registry: Arc<StateRegistry>,
    pages: Mutex<HashMap<Uuid, Arc<ListingPage>>>,
    metrics: Arc<InputMetrics>,
    faults: FaultHandler,
    throttle: Arc<LogThrottle>,
}

impl WorkerContext {
    fn lock_pages(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<ListingPage>>> {
        self.pages.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct BucketPoller {
    config: PollerConfig,
    store: Arc<dyn ObjectStoreApi>,
    factory: Arc<ObjectProcessorFactory>,
    filters: FilterChain,
    workers: Arc<CountingSemaphore>,
    first_scan: AtomicBool,
    ctx: Arc<WorkerContext>,
}

impl BucketPoller {
    pub fn new(
        config: PollerConfig,
        store: Arc<dyn ObjectStoreApi>,
        factory: Arc<ObjectProcessorFactory>,
        registry: Arc<StateRegistry>,
        faults: FaultHandler,
        throttle: Arc<LogThrottle>,
    ) -> Self {
        let mut filters = FilterChain::new();
        if let Some(max_age) = config.ignore_older {
            filters = filters.with(IgnoreOlder::new(max_age));
        }
        if let Some(start) = config.start_timestamp {
            filters = filters.with(StartTimestamp::new(start));
        }

        let ctx = Arc::new(WorkerContext {
            bucket: config.bucket_name.clone(),
            ignore_older: config.ignore_older,
            registry,
            pages: Mutex::new(HashMap::new()),
            metrics: factory.metrics().clone(),
            faults,
            throttle,
        });

        Self {
            workers: Arc::new(CountingSemaphore::new(config.number_of_workers.max(1))),
            first_scan: AtomicBool::new(true),
            config,
            store,
            factory,
            filters,
            ctx,
        }
    }

    pub fn registry(&self) -> &Arc<StateRegistry> {
        &self.ctx.registry
    }

    /// Pages whose purge lock is still held.
    pub fn pending_pages(&self) -> Vec<Arc<ListingPage>> {
        self.ctx.lock_pages().values().cloned().collect()
    }

    /// Scans the bucket every `interval` until `cancel` fires.
    #[instrument(skip(self, cancel), fields(bucket = %self.config.bucket_name))]
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            prefix = %self.config.list_prefix,
            interval_secs = self.config.interval.as_secs(),
            workers = self.config.number_of_workers,
            strategy = ?self.config.strategy,
            "bucket poller started"
        );

        loop {
            let report = self.scan(&cancel).await;
            debug!(?report, "scan finished");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
        info!("bucket poller stopped");
    }

    /// One pass over the bucket listing. Returns after every dispatched
    /// object finished.
    ///
    /// Listing failures are counted per scan: an abandoned scan does not
    /// carry its failures into the next one.
    pub async fn scan(&self, cancel: &CancellationToken) -> ScanReport {
        let strategy = self.config.strategy;
        let breaker = CircuitBreaker::new(self.config.failure_threshold);
        let first_scan = self.first_scan.load(Ordering::SeqCst);
        let mut pager = self.store.list_objects(
            &self.config.bucket_name,
            &self.config.list_prefix,
            strategy.start_after_key(&self.ctx.registry),
        );

        let mut report = ScanReport::default();
        let mut known_ids = HashSet::new();
        let mut listed_keys = HashSet::new();
        let mut tasks = JoinSet::new();
        let mut abandoned = false;

        'pages: while pager.has_more_pages() {
            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ObjectStoreError::Cancelled),
                page = pager.next_page() => page,
            };

            let listed = match page {
                Ok(listed) => {
                    breaker.record_success();
                    listed
                }
                Err(ObjectStoreError::Cancelled) => {
                    abandoned = true;
                    break;
                }
                Err(e) => {
                    let tripped = breaker.record_failure();
                    warn!(
                        error = %e,
                        consecutive_failures = breaker.consecutive_failures(),
                        "failed to list bucket page"
                    );
                    if tripped {
                        error!(
                            threshold = self.config.failure_threshold,
                            "too many consecutive listing failures; abandoning scan"
                        );
                        abandoned = true;
                        break;
                    }
                    continue;
                }
            };

            report.listed += listed.len();
            InputMetrics::add(&self.ctx.metrics.s3_objects_listed, listed.len() as u64);

            let now = Utc::now();
            let mut work = Vec::new();
            for obj in listed {
                let state = ObjectState::new(
                    self.config.bucket_name.as_str(),
                    obj.key,
                    obj.etag,
                    obj.last_modified,
                );
                known_ids.insert(strategy.state_id(&state));
                listed_keys.insert(state.key.clone());

                if strategy.should_skip_object(&self.ctx.registry, &state)
                    || !self.filters.is_valid(&state, now, first_scan)
                {
                    report.skipped += 1;
                    continue;
                }

                let obj_ref = ObjectRef::new(
                    self.config.bucket_name.as_str(),
                    self.config.bucket_arn.as_str(),
                    state.key.as_str(),
                )
                .with_region(self.config.region.as_str());
                match self.factory.create(obj_ref, cancel.child_token()) {
                    Some(processor) => work.push((state, processor)),
                    None => report.skipped += 1,
                }
            }

            if work.is_empty() {
                continue;
            }

            let page = ListingPage::new(self.config.bucket_name.as_str(), work.len());
            self.ctx.lock_pages().insert(page.id(), page.clone());
            debug!(page_id = %page.id(), objects = work.len(), "dispatching listing page");

            for (state, processor) in work {
                let Ok(granted) = self.workers.acquire_with_cancel(1, cancel).await else {
                    abandoned = true;
                    break 'pages;
                };
                if let Err(e) = self.ctx.registry.mark_in_flight(&state.key) {
                    warn!(object_key = %state.key, error = %e, "failed to persist in-flight key");
                }

                report.dispatched += 1;
                let ctx = self.ctx.clone();
                let workers = self.workers.clone();
                let page = page.clone();
                tasks.spawn(async move {
                    process_work_item(&ctx, state, processor, &page).await;
                    workers.release(granted);
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "poller worker task failed");
            }
        }

        self.first_scan.store(false, Ordering::SeqCst);
        report.complete = !abandoned && !cancel.is_cancelled();
        if report.complete {
            match self.ctx.registry.clean_up(&known_ids) {
                Ok(removed) if removed > 0 => debug!(removed, "removed states of vanished objects"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to clean up registry"),
            }
            match self.ctx.registry.retain_unresolved(&listed_keys) {
                Ok(forgotten) if forgotten > 0 => debug!(forgotten, "forgot unresolved keys of vanished objects"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to update unresolved keys"),
            }
        }
        persist_registry(&self.ctx.registry).await;
        report
    }
}

async fn process_work_item(
    ctx: &WorkerContext,
    mut state: ObjectState,
    mut processor: ObjectProcessor,
    page: &ListingPage,
) {
    let result = match processor.process().await {
        Ok(_) => processor.wait().await,
        Err(e) => Err(e),
    };

    let committed = match result {
        Ok(()) => {
            InputMetrics::incr(&ctx.metrics.s3_objects_processed);
            state.mark_stored();
            Some(state)
        }
        Err(ProcessError::Cancelled) => {
            // The page is never flushed after shutdown.
            mark_unresolved(ctx, &state.key);
            return;
        }
        Err(ProcessError::Fault(fault)) => {
            ctx.faults.trigger("bucket poller worker", fault);
            mark_unresolved(ctx, &state.key);
            return;
        }
        Err(e) if e.is_retryable() => {
            InputMetrics::incr(&ctx.metrics.s3_objects_failed);
            warn!(object_key = %state.key, error = %e, "retryable object failure; retrying on a later scan");
            mark_unresolved(ctx, &state.key);
            None
        }
        Err(e) => {
            InputMetrics::incr(&ctx.metrics.s3_objects_failed);
            let cause = format!("{}: {e}", state.key);
            if ctx.throttle.allow(&cause) {
                error!(object_key = %state.key, error = %e, "object processing failed; marking it failed");
            }
            state.mark_failed();
            Some(state)
        }
    };

    let committed_at = committed.as_ref().map(|st| st.last_modified);
    if let Some(state) = committed {
        if let Err(e) = ctx.registry.add_state(state) {
            error!(error = %e, "failed to persist object state");
        }
    }

    if page.resolve_one(committed_at) {
        ctx.lock_pages().remove(&page.id());
        match ctx
            .registry
            .flush(&ctx.bucket, page.committed(), ctx.ignore_older, Utc::now())
        {
            Ok(flushed) => debug!(page_id = %page.id(), ?flushed, "listing page resolved"),
            Err(e) => error!(page_id = %page.id(), error = %e, "failed to flush state registry"),
        }
        persist_registry(&ctx.registry).await;
    }
}

fn mark_unresolved(ctx: &WorkerContext, key: &str) {
    if let Err(e) = ctx.registry.mark_unresolved(key) {
        warn!(object_key = %key, error = %e, "failed to record unresolved key");
    }
}

/// Writes the registry out on the blocking pool.
async fn persist_registry(registry: &Arc<StateRegistry>) {
    let registry = registry.clone();
    match tokio::task::spawn_blocking(move || registry.persist()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "failed to persist state registry"),
        Err(e) => error!(error = %e, "state persistence task failed"),
    }
}
