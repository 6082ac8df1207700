//! Durable at-least-once job queue with retry and backoff.
//!
//! A single scheduler task owns all job state. It moves jobs between
//! per-queue ready lists, a delay heap of scheduled retries and a fixed
//! pool of workers. Every state transition is written through the
//! [`Store`] so that a restarted queue picks up where it left off.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{DeliveryError, QueueError, StoreError};
use crate::retry::RetryPolicy;
use crate::storage::Store;
use crate::telemetry::metric_inc;
use crate::types::WebhookTask;

pub const DEFAULT_QUEUE: &str = "default";

/// Lifecycle of a job inside the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting for a free worker.
    Pending,
    /// Handed to a worker; the current attempt has not concluded.
    InFlight,
    Succeeded,
    /// Last attempt failed; waiting out the backoff delay.
    FailedRetryable,
    /// Retry budget exhausted or failure was permanent.
    DeadLettered,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InFlight => "in_flight",
            JobState::Succeeded => "succeeded",
            JobState::FailedRetryable => "failed_retryable",
            JobState::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::DeadLettered)
    }
}

/// A unit of work consumed by workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,

    /// Snapshot of the task as persisted at ingestion.
    pub task: WebhookTask,
    pub queue: String,

    /// 1-based number of the current (or next) execution.
    pub attempt: u32,
    pub max_attempts: u32,

    /// Deadline for a single execution.
    pub timeout: Duration,
    pub state: JobState,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
}

/// Per-job options supplied at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub queue: String,
    pub max_attempts: u32,
    pub timeout: Duration,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            max_attempts: 5,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Executes a single attempt of a job.
///
/// The handler must honor `deadline` on its own I/O. The queue only
/// reclaims a handler that overruns the deadline by more than the
/// configured grace period.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job, deadline: Instant) -> Result<(), DeliveryError>;
}

/// A named queue and how many of its jobs may be dispatched per round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub per_round: usize,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum jobs executing at once across the whole pool.
    pub concurrency: usize,
    pub queues: Vec<QueueSpec>,
    pub retry: RetryPolicy,

    /// Extra time past a job's deadline before its handler is aborted.
    pub timeout_grace: Duration,

    /// Buffered enqueue requests before callers wait.
    pub submit_buffer: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            queues: vec![QueueSpec {
                name: DEFAULT_QUEUE.to_string(),
                per_round: 10,
            }],
            retry: RetryPolicy::default(),
            timeout_grace: Duration::from_secs(2),
            submit_buffer: 1_024,
        }
    }
}

/// Result of one execution, sent from a worker back to the scheduler.
#[derive(Debug)]
struct JobReport {
    job: Job,
    result: Result<(), DeliveryError>,
}

pub struct DeliveryQueue {
    submit_tx: mpsc::Sender<Job>,
    store: Arc<dyn Store>,
    queue_names: Vec<String>,
    is_running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DeliveryQueue {
    /// Start the scheduler and worker pool, recovering unfinished jobs
    /// from the store.
    pub async fn start(
        config: QueueConfig,
        store: Arc<dyn Store>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self, StoreError> {
        let concurrency = config.concurrency.max(1);
        let (submit_tx, submit_rx) = mpsc::channel(config.submit_buffer.max(1));
        let (dispatch_tx, dispatch_rx) = mpsc::channel(concurrency);
        let (report_tx, report_rx) = mpsc::channel(concurrency);
        let shared_dispatch_rx = Arc::new(Mutex::new(dispatch_rx));

        let mut worker_handles = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            worker_handles.push(tokio::spawn(worker_loop(
                shared_dispatch_rx.clone(),
                handler.clone(),
                report_tx.clone(),
                config.timeout_grace,
            )));
        }
        drop(report_tx);

        let shutdown = CancellationToken::new();
        let mut scheduler = Scheduler::new(&config, concurrency, store.clone(), dispatch_tx);
        scheduler.recover().await?;

        let scheduler_handle = tokio::spawn(scheduler.run(submit_rx, report_rx, shutdown.clone()));

        info!(
            concurrency,
            queues = config.queues.len(),
            "delivery queue started"
        );

        Ok(Self {
            submit_tx,
            store,
            queue_names: config.queues.iter().map(|q| q.name.clone()).collect(),
            is_running: Arc::new(AtomicBool::new(true)),
            shutdown,
            scheduler_handle: Mutex::new(Some(scheduler_handle)),
            worker_handles: Mutex::new(worker_handles),
        })
    }

    /// Persist a new job and hand it to the scheduler.
    ///
    /// Returns only once the job is durable. A failure here means the
    /// caller must not report the task as accepted.
    pub async fn enqueue(
        &self,
        task: WebhookTask,
        options: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(QueueError::Shutdown);
        }
        if !self.queue_names.iter().any(|q| q == &options.queue) {
            return Err(QueueError::UnknownQueue(options.queue));
        }

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            task,
            queue: options.queue,
            attempt: 1,
            max_attempts: options.max_attempts.max(1),
            timeout: options.timeout,
            state: JobState::Pending,
            last_error: None,
            enqueued_at: now,
            next_attempt_at: now,
        };

        self.store.save_job(&job).await?;

        let job_id = job.id;
        let task_id = job.task.id;
        self.submit_tx
            .send(job)
            .await
            .map_err(|_| QueueError::Shutdown)?;

        debug!(job_id = %job_id, task_id = %task_id, "job enqueued");
        metric_inc("webhook.queue.enqueued");
        Ok(job_id)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop dispatching, wait for in-flight attempts to conclude and join
    /// all background tasks. Pending and scheduled jobs stay in the store.
    pub async fn shutdown(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();

        let scheduler = self.scheduler_handle.lock().await.take();
        if let Some(handle) = scheduler {
            let _ = handle.await;
        }

        let workers: Vec<_> = self.worker_handles.lock().await.drain(..).collect();
        for handle in workers {
            let _ = handle.await;
        }
        info!("delivery queue stopped");
    }
}

impl Drop for DeliveryQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug)]
struct TimedJob {
    ready_at: Instant,
    job: Job,
}

impl Eq for TimedJob {}

impl PartialEq for TimedJob {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at.eq(&other.ready_at)
    }
}

impl Ord for TimedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.ready_at.cmp(&self.ready_at)
    }
}

impl PartialOrd for TimedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Scheduler {
    store: Arc<dyn Store>,
    retry: RetryPolicy,
    concurrency: usize,
    queues: Vec<QueueSpec>,
    ready: HashMap<String, VecDeque<Job>>,
    delayed: BinaryHeap<TimedJob>,
    dispatch_tx: mpsc::Sender<Job>,
    in_flight: usize,
    next_queue: usize,
}

impl Scheduler {
    fn new(
        config: &QueueConfig,
        concurrency: usize,
        store: Arc<dyn Store>,
        dispatch_tx: mpsc::Sender<Job>,
    ) -> Self {
        let ready = config
            .queues
            .iter()
            .map(|q| (q.name.clone(), VecDeque::new()))
            .collect();

        Self {
            store,
            retry: config.retry.clone(),
            concurrency,
            queues: config.queues.clone(),
            ready,
            delayed: BinaryHeap::new(),
            dispatch_tx,
            in_flight: 0,
            next_queue: 0,
        }
    }

    /// Reload unfinished jobs after a restart.
    ///
    /// A job found in flight was interrupted mid-attempt. That attempt
    /// counts as consumed so its sequence number is never reused.
    async fn recover(&mut self) -> Result<(), StoreError> {
        let jobs = self.store.load_unfinished_jobs().await?;
        if jobs.is_empty() {
            return Ok(());
        }

        info!(count = jobs.len(), "recovering unfinished jobs");
        for job in jobs {
            match job.state {
                JobState::Pending => self.push_ready(job),
                JobState::FailedRetryable => {
                    let wait = (job.next_attempt_at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    self.delayed.push(TimedJob {
                        ready_at: Instant::now() + wait,
                        job,
                    });
                }
                JobState::InFlight => {
                    let err =
                        DeliveryError::Persistence("attempt interrupted by restart".to_string());
                    self.conclude_failure(job, err).await;
                }
                JobState::Succeeded | JobState::DeadLettered => {}
            }
        }
        Ok(())
    }

    async fn run(
        mut self,
        mut submit_rx: mpsc::Receiver<Job>,
        mut report_rx: mpsc::Receiver<JobReport>,
        shutdown: CancellationToken,
    ) {
        let mut accepting = true;

        loop {
            if accepting {
                self.promote_due().await;
                self.dispatch_round().await;
            } else if self.in_flight == 0 {
                break;
            }

            let next_ready = self.delayed.peek().map(|t| t.ready_at);

            tokio::select! {
                maybe_job = submit_rx.recv(), if accepting => {
                    match maybe_job {
                        Some(job) => self.push_ready(job),
                        None => accepting = false,
                    }
                }
                Some(report) = report_rx.recv() => {
                    self.in_flight = self.in_flight.saturating_sub(1);
                    self.handle_report(report).await;
                }
                _ = sleep_until(next_ready.unwrap_or_else(far_future)),
                    if accepting && next_ready.is_some() => {}
                _ = shutdown.cancelled(), if accepting => {
                    accepting = false;
                    submit_rx.close();
                    debug!(in_flight = self.in_flight, "scheduler draining in-flight attempts");
                }
                else => break,
            }
        }

        // Closing the dispatch channel lets idle workers exit.
        drop(self.dispatch_tx);
    }

    fn push_ready(&mut self, job: Job) {
        match self.ready.get_mut(&job.queue) {
            Some(queue) => queue.push_back(job),
            None => warn!(
                job_id = %job.id,
                queue = %job.queue,
                "dropping job for unconfigured queue"
            ),
        }
    }

    /// Move retries whose backoff has elapsed back to their ready queue.
    async fn promote_due(&mut self) {
        let now = Instant::now();
        while self.delayed.peek().is_some_and(|t| t.ready_at <= now) {
            let Some(TimedJob { mut job, .. }) = self.delayed.pop() else {
                break;
            };
            job.state = JobState::Pending;
            self.persist(&job).await;
            self.push_ready(job);
        }
    }

    /// Hand jobs to workers, taking at most `per_round` from each queue
    /// and never exceeding the pool's concurrency.
    async fn dispatch_round(&mut self) {
        let queue_count = self.queues.len();
        for offset in 0..queue_count {
            let spec = &self.queues[(self.next_queue + offset) % queue_count];
            let name = spec.name.clone();
            let per_round = spec.per_round.max(1);

            for _ in 0..per_round {
                if self.in_flight >= self.concurrency {
                    break;
                }
                let Some(mut job) = self.ready.get_mut(&name).and_then(|q| q.pop_front()) else {
                    break;
                };

                job.state = JobState::InFlight;
                self.persist(&job).await;

                let job_id = job.id;
                if self.dispatch_tx.send(job).await.is_err() {
                    error!(job_id = %job_id, "worker pool closed; job left in flight for recovery");
                    return;
                }
                self.in_flight += 1;
            }
        }
        if queue_count > 0 {
            self.next_queue = (self.next_queue + 1) % queue_count;
        }
    }

    async fn handle_report(&mut self, report: JobReport) {
        let JobReport { mut job, result } = report;
        match result {
            Ok(()) => {
                job.state = JobState::Succeeded;
                job.last_error = None;
                self.persist(&job).await;
                info!(
                    job_id = %job.id,
                    task_id = %job.task.id,
                    attempt = job.attempt,
                    "delivery succeeded"
                );
                metric_inc("webhook.delivery.success");
            }
            Err(err) => {
                metric_inc("webhook.delivery.failure");
                self.conclude_failure(job, err).await;
            }
        }
    }

    /// Reschedule a failed attempt or dead-letter the job.
    async fn conclude_failure(&mut self, mut job: Job, err: DeliveryError) {
        job.last_error = Some(err.to_string());

        if job.attempt >= job.max_attempts {
            job.state = JobState::DeadLettered;
            self.persist(&job).await;
            warn!(
                job_id = %job.id,
                task_id = %job.task.id,
                attempt = job.attempt,
                error = %err,
                "job dead-lettered"
            );
            metric_inc("webhook.delivery.dead_lettered");
            return;
        }

        let delay = self.retry.delay_for(job.attempt);
        job.attempt += 1;
        job.state = JobState::FailedRetryable;
        job.next_attempt_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.persist(&job).await;

        debug!(
            job_id = %job.id,
            task_id = %job.task.id,
            next_attempt = job.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retry scheduled"
        );
        metric_inc("webhook.delivery.retry_scheduled");

        self.delayed.push(TimedJob {
            ready_at: Instant::now() + delay,
            job,
        });
    }

    async fn persist(&self, job: &Job) {
        if let Err(e) = self.store.save_job(job).await {
            error!(
                job_id = %job.id,
                state = job.state.as_str(),
                error = %e,
                "failed to persist job state"
            );
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}

/// Main worker loop.
///
/// Each worker pulls one job at a time, runs the handler on its own task
/// so a stuck or panicking handler can be reclaimed, and reports back.
async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    handler: Arc<dyn JobHandler>,
    report_tx: mpsc::Sender<JobReport>,
    grace: Duration,
) {
    loop {
        let job = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        let Some(job) = job else { break };

        let result = execute(&job, handler.clone(), grace).await;
        if report_tx.send(JobReport { job, result }).await.is_err() {
            break;
        }
    }
}

async fn execute(
    job: &Job,
    handler: Arc<dyn JobHandler>,
    grace: Duration,
) -> Result<(), DeliveryError> {
    let deadline = Instant::now() + job.timeout;
    let owned = job.clone();
    let mut attempt = tokio::spawn(async move { handler.handle(&owned, deadline).await });

    match timeout_at(deadline + grace, &mut attempt).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            error!(job_id = %job.id, error = %join_err, "delivery handler aborted");
            Err(DeliveryError::Transport(format!("handler aborted: {join_err}")))
        }
        Err(_) => {
            attempt.abort();
            warn!(
                job_id = %job.id,
                timeout_ms = job.timeout.as_millis() as u64,
                "delivery handler overran deadline"
            );
            Err(DeliveryError::Timeout(job.timeout))
        }
    }
}
