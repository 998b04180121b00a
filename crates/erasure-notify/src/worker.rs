//! Asynchronous handoff from the request path to the deletion pipeline.
//!
//! The compliance handler never calls the pipeline itself. It submits a
//! `DeletionJob` to a bounded `DeletionQueue` and answers the platform at
//! once; a `DeletionWorker` task drains the queue, calling the pipeline with
//! per-attempt timeouts, exponential backoff and a circuit breaker. Retries
//! here run on their own clock and are never visible to the platform.

use chrono::Utc;
use erasure_core::{
    BeginOutcome, CoreError, DedupStore, DeletionPipeline, DeletionRequest,
    NotificationId, DEFAULT_RETENTION_DAYS,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{NotifyError, NotifyResult};

const QUEUE_CLOSED_REASON: &str = "deletion queue closed";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on a single pipeline or store call.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> NotifyResult<()> {
        if self.max_attempts == 0 {
            return Err(NotifyError::ConfigurationError(
                "max_attempts must be > 0".into(),
            ));
        }
        if self.attempt_timeout.is_zero() {
            return Err(NotifyError::ConfigurationError(
                "attempt_timeout must be > 0".into(),
            ));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(NotifyError::ConfigurationError(
                "max_backoff must be >= initial_backoff".into(),
            ));
        }
        Ok(())
    }

    /// Delay after the given (1-based) failed attempt: initial * 2^(attempt-1), capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue_capacity: usize,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub breaker_threshold: u32,
    pub breaker_recovery: Duration,
    pub retention_days: u32,
    pub prune_interval: Duration,
    /// How long shutdown waits for in-flight jobs before detaching them.
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_concurrency: 8,
            retry: RetryPolicy::default(),
            breaker_threshold: 5,
            breaker_recovery: Duration::from_secs(30),
            retention_days: DEFAULT_RETENTION_DAYS,
            prune_interval: Duration::from_secs(3600),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs and the queue handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionJob {
    pub request: DeletionRequest,
    /// Set when the dedup store could not be reached on the request path;
    /// the worker must claim the id itself before calling the pipeline.
    pub needs_claim: bool,
}

impl DeletionJob {
    pub fn claimed(request: DeletionRequest) -> Self {
        Self {
            request,
            needs_claim: false,
        }
    }

    pub fn unclaimed(request: DeletionRequest) -> Self {
        Self {
            request,
            needs_claim: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The job is in the queue.
    Queued,
    /// The queue was full; a detached task will enqueue it when space frees up.
    Deferred,
}

/// Cloneable, non-blocking submission handle.
#[derive(Clone)]
pub struct DeletionQueue {
    tx: mpsc::Sender<DeletionJob>,
    store: Arc<dyn DedupStore>,
}

impl DeletionQueue {
    /// Hand a job to the worker without waiting.
    ///
    /// Must be called from within a Tokio runtime: a full queue spawns a
    /// detached task that waits for capacity.
    pub fn submit(&self, job: DeletionJob) -> NotifyResult<SubmitOutcome> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(SubmitOutcome::Queued),
            Err(TrySendError::Full(job)) => {
                warn!(
                    notification_id = %job.request.notification_id,
                    "deletion queue full, deferring job"
                );
                let tx = self.tx.clone();
                let store = Arc::clone(&self.store);
                tokio::spawn(async move {
                    let id = job.request.notification_id.clone();
                    let claimed = !job.needs_claim;
                    if tx.send(job).await.is_err() {
                        error!(notification_id = %id, "deletion queue closed before deferred job was queued");
                        if claimed {
                            record_failure(store.as_ref(), &id, QUEUE_CLOSED_REASON).await;
                        }
                    }
                });
                Ok(SubmitOutcome::Deferred)
            }
            Err(TrySendError::Closed(_)) => Err(NotifyError::QueueClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Build a queue handle and the worker that drains it.
pub fn deletion_channel(
    store: Arc<dyn DedupStore>,
    pipeline: Arc<dyn DeletionPipeline>,
    config: WorkerConfig,
) -> (DeletionQueue, DeletionWorker) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let queue = DeletionQueue {
        tx,
        store: Arc::clone(&store),
    };
    let ctx = Arc::new(JobContext {
        store,
        pipeline,
        retry: config.retry.clone(),
        breaker: Mutex::new(CircuitBreaker::with_recovery_timeout(
            config.breaker_threshold,
            config.breaker_recovery,
        )),
    });
    let worker = DeletionWorker { rx, ctx, config };
    (queue, worker)
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The pipeline accepted the request.
    Processed,
    /// Retries exhausted, the pipeline refused, or the id could never be
    /// claimed.
    Failed,
    /// Another delivery already owns this notification.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub pruned: u64,
}

impl WorkerReport {
    fn record(&mut self, joined: Result<JobOutcome, JoinError>) {
        match joined {
            Ok(JobOutcome::Processed) => self.processed += 1,
            Ok(JobOutcome::Failed) => self.failed += 1,
            Ok(JobOutcome::Skipped) => self.skipped += 1,
            Err(e) => {
                error!(error = %e, "deletion job task aborted");
                self.failed += 1;
            }
        }
    }
}

pub struct DeletionWorker {
    rx: mpsc::Receiver<DeletionJob>,
    ctx: Arc<JobContext>,
    config: WorkerConfig,
}

impl DeletionWorker {
    /// Drain the queue until every `DeletionQueue` handle is dropped or
    /// `cancel` fires. On exit, jobs already queued are still run; in-flight
    /// jobs get `drain_timeout` to finish and are then detached, not aborted.
    pub async fn run(mut self, cancel: CancellationToken) -> WorkerReport {
        let mut report = WorkerReport::default();
        let mut tasks: JoinSet<JobOutcome> = JoinSet::new();
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        let mut prune_tick =
            tokio::time::interval(self.config.prune_interval.max(Duration::from_secs(1)));
        prune_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            pipeline = self.ctx.pipeline.name(),
            concurrency = self.config.max_concurrency,
            "deletion worker started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(job) => self.spawn_job(&mut tasks, &permits, job).await,
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => report.record(joined),
                _ = prune_tick.tick() => report.pruned += self.prune().await,
            }
        }

        self.rx.close();
        while let Some(job) = self.rx.recv().await {
            self.spawn_job(&mut tasks, &permits, job).await;
        }

        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                report.record(joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                in_flight = tasks.len(),
                "drain timeout reached, detaching in-flight deletion jobs"
            );
            tasks.detach_all();
        }

        info!(
            processed = report.processed,
            failed = report.failed,
            skipped = report.skipped,
            "deletion worker stopped"
        );
        report
    }

    async fn spawn_job(
        &self,
        tasks: &mut JoinSet<JobOutcome>,
        permits: &Arc<Semaphore>,
        job: DeletionJob,
    ) {
        let permit = Arc::clone(permits).acquire_owned().await.ok();
        let ctx = Arc::clone(&self.ctx);
        tasks.spawn(async move {
            let _permit = permit;
            ctx.process(job).await
        });
    }

    async fn prune(&self) -> u64 {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.config.retention_days));
        match self.ctx.store.prune_expired(cutoff).await {
            Ok(0) => 0,
            Ok(n) => {
                info!(pruned = n, "pruned expired dedup records");
                n
            }
            Err(e) => {
                warn!(error = %e, "dedup prune failed");
                0
            }
        }
    }
}

struct JobContext {
    store: Arc<dyn DedupStore>,
    pipeline: Arc<dyn DeletionPipeline>,
    retry: RetryPolicy,
    breaker: Mutex<CircuitBreaker>,
}

impl JobContext {
    fn breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        self.breaker.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn process(&self, job: DeletionJob) -> JobOutcome {
        let id = job.request.notification_id.clone();

        if job.needs_claim {
            match self.claim(&id).await {
                Some(BeginOutcome::Started) => {}
                Some(BeginOutcome::AlreadySeen) => {
                    debug!(notification_id = %id, "notification already claimed, skipping");
                    return JobOutcome::Skipped;
                }
                None => {
                    error!(notification_id = %id, "dedup store unreachable, deletion not handed off");
                    return JobOutcome::Failed;
                }
            }
        }

        match self.deliver(&job.request).await {
            Ok(attempts) => {
                info!(notification_id = %id, attempts, "deletion handed to pipeline");
                if let Err(e) = self.store.mark_processed(&id).await {
                    error!(notification_id = %id, error = %e, "failed to mark notification processed");
                }
                JobOutcome::Processed
            }
            Err(reason) => {
                error!(notification_id = %id, reason = %reason, "deletion could not be handed to pipeline");
                record_failure(self.store.as_ref(), &id, &reason).await;
                JobOutcome::Failed
            }
        }
    }

    /// Claim an id the request path could not. A timed-out attempt is kept
    /// and awaited again rather than reissued; only a failed one is retried.
    async fn claim(&self, id: &NotificationId) -> Option<BeginOutcome> {
        let mut in_flight = None;
        for attempt in 1..=self.retry.max_attempts {
            let claim = in_flight.get_or_insert_with(|| self.store.try_begin_processing(id));
            let result = tokio::time::timeout(self.retry.attempt_timeout, claim.as_mut()).await;
            match result {
                Ok(Ok(outcome)) => return Some(outcome),
                Ok(Err(e)) => {
                    in_flight = None;
                    warn!(notification_id = %id, attempt, error = %e, "dedup claim failed");
                }
                Err(_) => warn!(notification_id = %id, attempt, "dedup claim slow, still waiting"),
            }
            if in_flight.is_none() && attempt < self.retry.max_attempts {
                tokio::time::sleep(self.retry.backoff_for(attempt)).await;
            }
        }
        None
    }

    /// Returns the number of attempts used, or the reason for giving up.
    async fn deliver(&self, request: &DeletionRequest) -> Result<u32, String> {
        let mut last_error = String::new();
        for attempt in 1..=self.retry.max_attempts {
            self.wait_for_breaker().await;

            let result = tokio::time::timeout(
                self.retry.attempt_timeout,
                self.pipeline.enqueue_deletion(request),
            )
            .await
            .unwrap_or_else(|_| {
                Err(CoreError::DownstreamUnavailable(
                    "pipeline call timed out".into(),
                ))
            });

            match result {
                Ok(()) => {
                    self.breaker().record_success();
                    return Ok(attempt);
                }
                Err(e) if !e.is_retryable() => return Err(e.to_string()),
                Err(e) => {
                    self.breaker().record_failure();
                    warn!(
                        notification_id = %request.notification_id,
                        attempt,
                        error = %e,
                        "pipeline attempt failed"
                    );
                    last_error = e.to_string();
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.backoff_for(attempt)).await;
                    }
                }
            }
        }
        Err(format!(
            "gave up after {} attempts: {}",
            self.retry.max_attempts, last_error
        ))
    }

    async fn wait_for_breaker(&self) {
        loop {
            let wait = {
                let mut breaker = self.breaker();
                if breaker.should_allow() {
                    None
                } else {
                    Some(breaker.retry_after().unwrap_or(Duration::from_millis(100)))
                }
            };
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

async fn record_failure(store: &dyn DedupStore, id: &NotificationId, reason: &str) {
    if let Err(e) = store.mark_failed(id, reason).await {
        error!(notification_id = %id, error = %e, "failed to mark notification failed");
    }
}
