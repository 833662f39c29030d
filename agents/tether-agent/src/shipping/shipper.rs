//! Batch Shipper
//!
//! Background pipeline that drains the log queue in batches, uploads them,
//! applies the requeue/drop policy on failure, and drains what is left on
//! shutdown.

use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cli::config::{CollectorConfig, ShippingConfig};
use crate::connection::client::ResilientClient;
use crate::error::ClientError;
use crate::shipping::queue::LogQueue;
use crate::shipping::record::{ExecutionContext, LogRecord};
use crate::shipping::state::{ShipperState, ShipperStateManager};
use crate::shipping::tracker::{RetryDecision, RetryTracker};
use crate::shipping::uploader::{HttpLogUploader, LogUploader};

/// Sleep multiplier after a cycle fails unexpectedly
const LOOP_ERROR_BACKOFF_FACTOR: u32 = 10;

/// Batch size and cadence; changes apply from the next cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfiguration {
    pub batch_size: usize,
    pub processing_interval: Duration,
}

impl BatchConfiguration {
    pub fn new(batch_size: usize, processing_interval: Duration) -> Result<Self, ClientError> {
        let config = Self {
            batch_size,
            processing_interval,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.batch_size == 0 {
            return Err(ClientError::InvalidConfig(
                "batch size must be positive".into(),
            ));
        }
        if self.processing_interval.is_zero() {
            return Err(ClientError::InvalidConfig(
                "processing interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Shipper tuning
#[derive(Debug, Clone)]
pub struct ShipperOptions {
    pub batch: BatchConfiguration,
    pub max_record_retries: u32,
    pub worker_join_timeout: Duration,
    pub pending_upload_timeout: Duration,
}

impl ShipperOptions {
    pub fn from_config(config: &ShippingConfig) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self {
            batch: BatchConfiguration::new(config.batch_size, config.processing_interval())?,
            max_record_retries: config.max_record_retries,
            worker_join_timeout: config.worker_join_timeout(),
            pending_upload_timeout: config.pending_upload_timeout(),
        })
    }
}

impl Default for ShipperOptions {
    fn default() -> Self {
        Self {
            batch: BatchConfiguration {
                batch_size: 100,
                processing_interval: Duration::from_secs(1),
            },
            max_record_retries: 3,
            worker_join_timeout: Duration::from_secs(5),
            pending_upload_timeout: Duration::from_secs(10),
        }
    }
}

/// Pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoggingStats {
    /// Records waiting in the queue
    pub queued_count: usize,
    /// Records with at least one failed upload still pending
    pub retrying_count: usize,
    /// Upload tasks in flight
    pub pending_uploads: usize,
    /// Records delivered since construction
    pub delivered_count: u64,
    /// Records dropped since construction
    pub dropped_count: u64,
}

/// State shared by the shipper, its worker and upload tasks
struct Pipeline {
    uploader: Arc<dyn LogUploader>,
    queue: LogQueue,
    tracker: RetryTracker,
    batch: RwLock<BatchConfiguration>,
    accepting: AtomicBool,
    /// Set once the drain has finished; failures after that drop instead of requeueing
    closed: RwLock<bool>,
    /// Set when an upload task panicked; the loop backs off on its next cycle
    faulted: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Pipeline {
    fn batch(&self) -> BatchConfiguration {
        *self.batch.read()
    }

    /// Take one batch off the queue and hand it to a tracked upload task
    fn dispatch(self: &Arc<Self>, uploads: &TaskTracker, batch_size: usize) -> usize {
        let batch = self.queue.pop_batch(batch_size);
        let count = batch.len();
        if count == 0 {
            return 0;
        }

        debug!(records = count, "Dispatching batch");
        let pipeline = Arc::clone(self);
        uploads.spawn(async move {
            pipeline.upload_batch(batch, false).await;
        });
        count
    }

    async fn upload_batch(&self, batch: Vec<LogRecord>, draining: bool) -> bool {
        let outcome = AssertUnwindSafe(self.uploader.upload(&batch))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                error!(records = batch.len(), "Upload panicked, treating batch as failed");
                self.faulted.store(true, Ordering::Release);
                self.handle_failure(batch, draining);
                return false;
            }
        };

        match result {
            Ok(()) => {
                for record in batch.iter().filter(|r| r.has_id()) {
                    self.tracker.clear(&record.id);
                }
                self.delivered
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(records = batch.len(), error = %e, "Batch upload failed");
                self.handle_failure(batch, draining);
                false
            }
        }
    }

    fn handle_failure(&self, batch: Vec<LogRecord>, draining: bool) {
        // Held while requeueing so shutdown's final sweep sees every push.
        let gate = self.closed.read();
        let closed = *gate;

        for record in batch {
            if closed {
                self.tracker.clear(&record.id);
                self.drop_record(&record, "upload failed after shutdown");
                continue;
            }

            if !record.has_id() {
                // No id to count retries against.
                if draining {
                    self.drop_record(&record, "anonymous record failed during drain");
                } else {
                    self.queue.push(record);
                }
                continue;
            }

            match self.tracker.record_failure(&record.id) {
                RetryDecision::Requeue { attempts } => {
                    debug!(record_id = %record.id, attempts, "Requeueing log record");
                    self.queue.push(record);
                }
                RetryDecision::Drop { attempts } => {
                    error!(
                        record_id = %record.id,
                        attempts,
                        "Dropping log record after repeated upload failures"
                    );
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn drop_record(&self, record: &LogRecord, reason: &str) {
        error!(record_id = %record.id, reason, "Dropping log record");
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Worker task and its cancellation handle for one session
struct Session {
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

/// Batches queued records and ships them in the background
pub struct BatchShipper {
    pipeline: Arc<Pipeline>,
    options: ShipperOptions,
    state: ShipperStateManager,
    session: Mutex<Option<Session>>,
    uploads: Mutex<TaskTracker>,
}

impl BatchShipper {
    pub fn new(uploader: Arc<dyn LogUploader>, options: ShipperOptions) -> Result<Self, ClientError> {
        options.batch.validate()?;
        if options.max_record_retries == 0 {
            return Err(ClientError::InvalidConfig(
                "max record retries must be positive".into(),
            ));
        }

        let pipeline = Arc::new(Pipeline {
            uploader,
            queue: LogQueue::new(),
            tracker: RetryTracker::new(options.max_record_retries),
            batch: RwLock::new(options.batch),
            accepting: AtomicBool::new(false),
            closed: RwLock::new(false),
            faulted: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        Ok(Self {
            pipeline,
            options,
            state: ShipperStateManager::new(),
            session: Mutex::new(None),
            uploads: Mutex::new(TaskTracker::new()),
        })
    }

    /// Shipper that posts to the collector's logs path through `client`
    pub fn from_config(
        client: Arc<ResilientClient>,
        collector: &CollectorConfig,
        shipping: &ShippingConfig,
    ) -> Result<Self, ClientError> {
        let uploader = Arc::new(HttpLogUploader::new(client, collector.logs_path.clone()));
        Self::new(uploader, ShipperOptions::from_config(shipping)?)
    }

    pub fn state(&self) -> ShipperState {
        self.state.current_state()
    }

    pub fn state_manager(&self) -> &ShipperStateManager {
        &self.state
    }

    pub fn batch_configuration(&self) -> BatchConfiguration {
        self.pipeline.batch()
    }

    /// Swap batch size and interval; the running loop picks them up next cycle
    pub fn update_batch_configuration(&self, config: BatchConfiguration) -> Result<(), ClientError> {
        config.validate()?;
        *self.pipeline.batch.write() = config;
        info!(
            batch_size = config.batch_size,
            interval_ms = config.processing_interval.as_millis() as u64,
            "Batch configuration updated"
        );
        Ok(())
    }

    /// Start a shipping session. Must be called inside a Tokio runtime.
    pub fn initialize(&self) -> Result<(), ClientError> {
        self.pipeline.batch().validate()?;

        let mut session = self.session.lock();
        if !self.state.start() {
            debug!(state = %self.state.current_state(), "Shipper already started");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let uploads = TaskTracker::new();
        *self.uploads.lock() = uploads.clone();

        *self.pipeline.closed.write() = false;
        self.pipeline.faulted.store(false, Ordering::Release);
        self.pipeline.accepting.store(true, Ordering::Release);

        let worker = tokio::spawn(Self::run_loop(
            Arc::clone(&self.pipeline),
            uploads,
            cancel.clone(),
        ));

        *session = Some(Session { cancel, worker });
        info!(
            batch_size = self.pipeline.batch().batch_size,
            session = self.state.sessions(),
            "Batch shipper started"
        );
        Ok(())
    }

    /// Queue a record for shipping. Ignored unless the shipper is running.
    pub fn enqueue(&self, record: LogRecord) {
        if !self.pipeline.accepting.load(Ordering::Acquire) {
            return;
        }
        self.pipeline.queue.push(record);
    }

    /// Queue a record stamped with the caller's execution context
    pub fn enqueue_in(&self, context: &ExecutionContext, record: LogRecord) {
        self.enqueue(record.with_context(context));
    }

    pub fn stats(&self) -> LoggingStats {
        LoggingStats {
            queued_count: self.pipeline.queue.len(),
            retrying_count: self.pipeline.tracker.len(),
            pending_uploads: self.uploads.lock().len(),
            delivered_count: self.pipeline.delivered.load(Ordering::Relaxed),
            dropped_count: self.pipeline.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker, wait for in-flight uploads, and drain the queue.
    /// Never fails; problems are logged.
    pub async fn shutdown(&self) {
        let session = self.session.lock().take();
        let Some(session) = session else {
            debug!("Shipper not running, nothing to shut down");
            return;
        };

        self.pipeline.accepting.store(false, Ordering::Release);
        self.state.set_shutting_down();
        session.cancel.cancel();

        match tokio::time::timeout(self.options.worker_join_timeout, session.worker).await {
            Ok(Ok(())) => debug!("Shipper worker stopped"),
            Ok(Err(e)) => warn!(error = %e, "Shipper worker ended abnormally"),
            Err(_) => warn!(
                timeout_ms = self.options.worker_join_timeout.as_millis() as u64,
                "Shipper worker did not stop in time"
            ),
        }

        let uploads = self.uploads.lock().clone();
        uploads.close();
        if tokio::time::timeout(self.options.pending_upload_timeout, uploads.wait())
            .await
            .is_err()
        {
            warn!(
                pending = uploads.len(),
                "Abandoning in-flight uploads after timeout"
            );
        }

        let (delivered, dropped) = self.drain().await;

        // Anything requeued between the drain and closing is dropped here.
        *self.pipeline.closed.write() = true;
        for record in self.pipeline.queue.pop_batch(usize::MAX) {
            self.pipeline.tracker.clear(&record.id);
            self.pipeline.drop_record(&record, "requeued after drain");
        }
        let abandoned_retries = self.pipeline.tracker.len();
        self.pipeline.tracker.reset();

        self.state.set_stopped();
        info!(
            drained_delivered = delivered,
            drained_dropped = dropped,
            abandoned_retries,
            "Batch shipper stopped"
        );
    }

    /// Upload whatever is still queued, batch by batch, until the queue is empty.
    async fn drain(&self) -> (u64, u64) {
        let delivered_before = self.pipeline.delivered.load(Ordering::Relaxed);
        let dropped_before = self.pipeline.dropped.load(Ordering::Relaxed);
        let batch_size = self.pipeline.batch().batch_size;

        if !self.pipeline.queue.is_empty() {
            info!(queued = self.pipeline.queue.len(), "Draining log queue");
        }

        loop {
            let batch = self.pipeline.queue.pop_batch(batch_size);
            if batch.is_empty() {
                break;
            }
            self.pipeline.upload_batch(batch, true).await;
        }

        (
            self.pipeline.delivered.load(Ordering::Relaxed) - delivered_before,
            self.pipeline.dropped.load(Ordering::Relaxed) - dropped_before,
        )
    }

    async fn run_loop(pipeline: Arc<Pipeline>, uploads: TaskTracker, cancel: CancellationToken) {
        debug!("Shipper loop running");
        let mut delay = pipeline.batch().processing_interval;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let config = pipeline.batch();
            delay = Self::run_cycle(&pipeline, &uploads, config);
        }

        debug!("Shipper loop cancelled");
    }

    /// One loop iteration; returns how long to sleep before the next one
    fn run_cycle(pipeline: &Arc<Pipeline>, uploads: &TaskTracker, config: BatchConfiguration) -> Duration {
        let backoff = config.processing_interval * LOOP_ERROR_BACKOFF_FACTOR;

        if pipeline.faulted.swap(false, Ordering::AcqRel) {
            error!(
                backoff_ms = backoff.as_millis() as u64,
                "Upload task failed unexpectedly, backing off"
            );
            return backoff;
        }

        let cycle = std::panic::catch_unwind(AssertUnwindSafe(|| {
            pipeline.dispatch(uploads, config.batch_size)
        }));

        match cycle {
            Ok(_) => config.processing_interval,
            Err(_) => {
                error!(
                    backoff_ms = backoff.as_millis() as u64,
                    "Shipper cycle failed unexpectedly, backing off"
                );
                backoff
            }
        }
    }
}

impl Drop for BatchShipper {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.cancel.cancel();
        }
    }
}
