//! In-process priority job queue with a bounded worker pool.
//!
//! Jobs wait in a max-heap ordered by priority, then enqueue sequence. A
//! fixed set of worker tasks claim jobs from the heap under one mutex, so
//! each job is claimed by exactly one worker and at most `workers` jobs run
//! at once.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::Value;
use stepflow_types::config::QueueConfig;
use stepflow_types::event::{Event, EventPayload};
use stepflow_types::job::{JobId, JobPriority, JobRecord, JobStatus};
use stepflow_types::worker::WorkerError;
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;

pub type JobFuture = Pin<Box<dyn Future<Output = Result<Value, WorkerError>> + Send>>;

/// The work a job performs. Called once per attempt.
pub type JobTask = Arc<dyn Fn(JobContext) -> JobFuture + Send + Sync>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job queue is shut down")]
    ShutDown,

    #[error("job not found: {0}")]
    NotFound(JobId),
}

/// Handed to a job's task on every attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cancelled on `cancel`, timeout or queue shutdown.
    pub cancel: CancellationToken,
}

/// A unit of work to enqueue.
pub struct JobSpec {
    pub label: Option<String>,
    pub priority: JobPriority,
    /// Overrides `QueueConfig::default_timeout_ms`.
    pub timeout: Option<Duration>,
    task: JobTask,
}

impl JobSpec {
    pub fn new<F, Fut>(task: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkerError>> + Send + 'static,
    {
        Self {
            label: None,
            priority: JobPriority::default(),
            timeout: None,
            task: Arc::new(move |ctx| Box::pin(task(ctx))),
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSpec")
            .field("label", &self.label)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    /// Highest number of jobs ever running at once.
    pub peak_running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

/// Heap entry: higher priority first, then lower sequence (FIFO).
#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: JobPriority,
    seq: u64,
    id: JobId,
}

impl QueueEntry {
    fn key(&self) -> (JobPriority, Reverse<u64>) {
        (self.priority, Reverse(self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key().cmp(&other.key())
    }
}

struct JobSlot {
    record: JobRecord,
    task: JobTask,
    cancel: CancellationToken,
    requeued: bool,
    done: watch::Sender<JobStatus>,
}

struct Claimed {
    id: JobId,
    task: JobTask,
    ctx: JobContext,
    timeout: Option<Duration>,
}

enum AttemptOutcome {
    Finished(Result<Value, WorkerError>),
    TimedOut(Duration),
    Cancelled,
}

struct Shared {
    config: QueueConfig,
    /// Claim order. Entries for cancelled jobs are skipped lazily.
    heap: Mutex<BinaryHeap<QueueEntry>>,
    jobs: DashMap<JobId, JobSlot>,
    notify: Notify,
    next_seq: AtomicU64,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    shutdown: CancellationToken,
    bus: Option<EventBus>,
}

impl Shared {
    fn push(&self, id: JobId, priority: JobPriority) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut heap = self.heap.lock().unwrap_or_else(|p| p.into_inner());
        heap.push(QueueEntry { priority, seq, id });
        drop(heap);
        self.notify.notify_one();
    }

    /// Pop the best Queued job and mark it Running.
    fn claim(&self) -> Option<Claimed> {
        let mut heap = self.heap.lock().unwrap_or_else(|p| p.into_inner());
        while let Some(entry) = heap.pop() {
            let Some(mut slot) = self.jobs.get_mut(&entry.id) else {
                continue;
            };
            if slot.record.status != JobStatus::Queued {
                continue;
            }
            slot.record.status = JobStatus::Running;
            slot.record.attempts += 1;
            slot.record.started_at = Some(Utc::now());
            slot.done.send_replace(JobStatus::Running);

            let timeout = slot
                .record
                .timeout_ms
                .map(Duration::from_millis)
                .or_else(|| self.config.default_timeout_ms.map(Duration::from_millis));
            return Some(Claimed {
                id: entry.id,
                task: Arc::clone(&slot.task),
                ctx: JobContext {
                    job_id: entry.id,
                    attempt: slot.record.attempts,
                    cancel: slot.cancel.clone(),
                },
                timeout,
            });
        }
        None
    }

    async fn emit(&self, job_id: JobId, payload: EventPayload) {
        if let Some(bus) = &self.bus {
            bus.publish(Event::new(job_id, payload)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

/// Priority work queue with a fixed pool of worker tasks.
///
/// Construct with [`JobQueue::start`]; stop with [`JobQueue::shutdown`].
pub struct JobQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    /// Spawn `config.workers` workers. Must be called within a tokio runtime.
    pub fn start(config: QueueConfig, bus: Option<EventBus>) -> Self {
        let worker_count = config.workers.max(1);
        let shared = Arc::new(Shared {
            config,
            heap: Mutex::new(BinaryHeap::new()),
            jobs: DashMap::new(),
            notify: Notify::new(),
            next_seq: AtomicU64::new(0),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            bus,
        });

        let workers = (0..worker_count)
            .map(|worker| tokio::spawn(worker_loop(Arc::clone(&shared), worker)))
            .collect();

        tracing::info!(workers = worker_count, "job queue started");
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub async fn enqueue(&self, spec: JobSpec) -> Result<JobId, QueueError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(QueueError::ShutDown);
        }

        let id = Uuid::now_v7();
        let record = JobRecord {
            id,
            label: spec.label.clone(),
            priority: spec.priority,
            status: JobStatus::Queued,
            attempts: 0,
            timeout_ms: spec
                .timeout
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        };
        let (done, _) = watch::channel(JobStatus::Queued);
        self.shared.jobs.insert(
            id,
            JobSlot {
                record,
                task: spec.task,
                cancel: self.shared.shutdown.child_token(),
                requeued: false,
                done,
            },
        );

        tracing::debug!(job_id = %id, priority = ?spec.priority, label = ?spec.label, "job enqueued");
        self.shared
            .emit(
                id,
                EventPayload::JobEnqueued {
                    job_id: id,
                    priority: spec.priority,
                    label: spec.label,
                },
            )
            .await;
        self.shared.push(id, spec.priority);
        Ok(id)
    }

    /// Cancel a Queued or Running job. Returns false if the job is unknown or
    /// already finished.
    pub async fn cancel(&self, id: JobId) -> bool {
        let was_queued = {
            let Some(mut slot) = self.shared.jobs.get_mut(&id) else {
                return false;
            };
            match slot.record.status {
                JobStatus::Queued => {
                    slot.record.status = JobStatus::Cancelled;
                    slot.record.finished_at = Some(Utc::now());
                    slot.done.send_replace(JobStatus::Cancelled);
                    true
                }
                JobStatus::Running => {
                    // The worker running it records the finish.
                    slot.record.status = JobStatus::Cancelled;
                    slot.cancel.cancel();
                    false
                }
                _ => return false,
            }
        };

        tracing::debug!(job_id = %id, was_queued, "job cancelled");
        if was_queued {
            self.shared
                .emit(
                    id,
                    EventPayload::JobFinished {
                        job_id: id,
                        status: JobStatus::Cancelled,
                        error: None,
                    },
                )
                .await;
        }
        true
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.shared.jobs.get(&id).map(|slot| slot.record.status)
    }

    pub fn record(&self, id: JobId) -> Option<JobRecord> {
        self.shared.jobs.get(&id).map(|slot| slot.record.clone())
    }

    /// Wait until the job reaches a terminal status and return its record.
    pub async fn wait(&self, id: JobId) -> Result<JobRecord, QueueError> {
        let mut rx = self
            .shared
            .jobs
            .get(&id)
            .map(|slot| slot.done.subscribe())
            .ok_or(QueueError::NotFound(id))?;
        rx.wait_for(|status| status.is_terminal())
            .await
            .map(|_| ())
            .map_err(|_| QueueError::ShutDown)?;
        self.record(id).ok_or(QueueError::NotFound(id))
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            running: self.shared.running.load(Ordering::SeqCst),
            peak_running: self.shared.peak_running.load(Ordering::SeqCst),
            ..QueueStats::default()
        };
        for slot in self.shared.jobs.iter() {
            match slot.record.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
                JobStatus::Running => {}
            }
        }
        stats
    }

    /// Cancel running jobs, stop the workers and cancel whatever is still
    /// queued. Further `enqueue` calls fail with `QueueError::ShutDown`.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(|p| p.into_inner()),
        );
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "job worker task failed");
            }
        }

        let mut leftover = Vec::new();
        for mut slot in self.shared.jobs.iter_mut() {
            if !slot.record.status.is_terminal() {
                slot.record.status = JobStatus::Cancelled;
                slot.record.finished_at = Some(Utc::now());
                slot.done.send_replace(JobStatus::Cancelled);
                leftover.push(slot.record.id);
            }
        }
        for id in &leftover {
            self.shared
                .emit(
                    *id,
                    EventPayload::JobFinished {
                        job_id: *id,
                        status: JobStatus::Cancelled,
                        error: None,
                    },
                )
                .await;
        }
        tracing::info!(cancelled = leftover.len(), "job queue shut down");
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

async fn worker_loop(shared: Arc<Shared>, worker: usize) {
    tracing::debug!(worker, "job worker started");
    loop {
        // Register for wakeups before checking the heap so an enqueue that
        // lands in between is not missed.
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if shared.shutdown.is_cancelled() {
            break;
        }
        if let Some(claimed) = shared.claim() {
            run_job(&shared, claimed, worker).await;
            continue;
        }

        tokio::select! {
            _ = &mut notified => {}
            _ = shared.shutdown.cancelled() => break,
        }
    }
    tracing::debug!(worker, "job worker stopped");
}

async fn run_job(shared: &Shared, claimed: Claimed, worker: usize) {
    let Claimed {
        id,
        task,
        ctx,
        timeout,
    } = claimed;
    let attempt = ctx.attempt;
    let cancel = ctx.cancel.clone();

    let now_running = shared.running.fetch_add(1, Ordering::SeqCst) + 1;
    shared.peak_running.fetch_max(now_running, Ordering::SeqCst);
    tracing::debug!(job_id = %id, worker, attempt, "job started");
    shared
        .emit(id, EventPayload::JobStarted { job_id: id, attempt })
        .await;

    // A panicking job fails; the worker survives to claim the next one.
    let attempt_fut = async move {
        match AssertUnwindSafe(async move { task(ctx).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(job_id = %id, attempt, "job panicked");
                Err(WorkerError::failed("job panicked"))
            }
        }
    };
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => AttemptOutcome::Cancelled,
        outcome = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt_fut).await {
                    Ok(result) => AttemptOutcome::Finished(result),
                    Err(_) => AttemptOutcome::TimedOut(limit),
                },
                None => AttemptOutcome::Finished(attempt_fut.await),
            }
        } => outcome,
    };

    shared.running.fetch_sub(1, Ordering::SeqCst);
    finish_attempt(shared, id, outcome).await;
}

async fn finish_attempt(shared: &Shared, id: JobId, outcome: AttemptOutcome) {
    let (status, error, requeue) = {
        let Some(mut slot) = shared.jobs.get_mut(&id) else {
            return;
        };

        let mut requeue = None;
        if slot.record.status == JobStatus::Cancelled {
            // Cancelled while running; whatever the task returned is moot.
        } else {
            match outcome {
                AttemptOutcome::Finished(Ok(value)) => {
                    slot.record.status = JobStatus::Completed;
                    slot.record.result = Some(value);
                    slot.record.error = None;
                }
                AttemptOutcome::Finished(Err(err)) => {
                    slot.record.status = JobStatus::Failed;
                    slot.record.error = Some(err);
                }
                AttemptOutcome::TimedOut(limit) => {
                    slot.cancel.cancel();
                    if shared.config.requeue_on_timeout && !slot.requeued {
                        slot.requeued = true;
                        slot.cancel = shared.shutdown.child_token();
                        slot.record.status = JobStatus::Queued;
                        slot.done.send_replace(JobStatus::Queued);
                        requeue = Some(slot.record.priority);
                    } else {
                        slot.record.status = JobStatus::Failed;
                        slot.record.error = Some(WorkerError::timeout(limit));
                    }
                }
                AttemptOutcome::Cancelled => {
                    // Token fired without `cancel`: the queue is shutting down.
                    slot.record.status = JobStatus::Cancelled;
                }
            }
        }

        if requeue.is_none() {
            slot.record.finished_at = Some(Utc::now());
            slot.done.send_replace(slot.record.status);
        }
        (
            slot.record.status,
            slot.record.error.as_ref().map(ToString::to_string),
            requeue,
        )
    };

    if let Some(priority) = requeue {
        tracing::warn!(job_id = %id, "job timed out, requeueing once");
        shared.push(id, priority);
        return;
    }

    match status {
        JobStatus::Failed => {
            tracing::warn!(job_id = %id, error = ?error, "job failed")
        }
        _ => tracing::debug!(job_id = %id, status = %status, "job finished"),
    }
    shared
        .emit(
            id,
            EventPayload::JobFinished {
                job_id: id,
                status,
                error,
            },
        )
        .await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_types::event::EventKind;
    use tokio::sync::oneshot;

    use crate::event::subscriber::EventFilter;

    fn queue(workers: usize) -> JobQueue {
        JobQueue::start(QueueConfig::default().with_workers(workers), None)
    }

    /// Job that blocks until `gate` fires; `started` is signalled first.
    fn gated(started: oneshot::Sender<()>, gate: oneshot::Receiver<()>) -> JobSpec {
        let started = Mutex::new(Some(started));
        let gate = Arc::new(tokio::sync::Mutex::new(Some(gate)));
        JobSpec::new(move |_ctx| {
            if let Some(tx) = started.lock().unwrap().take() {
                let _ = tx.send(());
            }
            let gate = gate.clone();
            async move {
                if let Some(rx) = gate.lock().await.take() {
                    let _ = rx.await;
                }
                Ok(Value::Null)
            }
        })
    }

    #[tokio::test]
    async fn test_job_runs_and_returns_result() {
        let queue = queue(2);
        let id = queue
            .enqueue(JobSpec::new(|ctx: JobContext| async move {
                Ok(serde_json::json!({ "attempt": ctx.attempt }))
            }))
            .await
            .unwrap();

        let record = queue.wait(id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.result, Some(serde_json::json!({ "attempt": 1 })));
        assert!(record.started_at.is_some() && record.finished_at.is_some());
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_more_than_worker_count_running() {
        let queue = queue(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut ids = Vec::new();
        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            let spec = JobSpec::new(move |_ctx| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            });
            ids.push(queue.enqueue(spec).await.unwrap());
        }
        for id in ids {
            assert_eq!(queue.wait(id).await.unwrap().status, JobStatus::Completed);
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        let stats = queue.stats();
        assert_eq!(stats.peak_running, 2);
        assert_eq!(stats.completed, 6);
        assert_eq!(stats.running, 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_priority_order_then_fifo() {
        let queue = queue(1);
        let (started_tx, started_rx) = oneshot::channel();
        let (gate_tx, gate_rx) = oneshot::channel();
        let blocker = queue.enqueue(gated(started_tx, gate_rx)).await.unwrap();
        started_rx.await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut ids = Vec::new();
        for (name, priority) in [
            ("a", JobPriority::Low),
            ("b", JobPriority::Normal),
            ("c", JobPriority::High),
            ("d", JobPriority::Critical),
            ("e", JobPriority::Normal),
        ] {
            let order = order.clone();
            let spec = JobSpec::new(move |_ctx| {
                order.lock().unwrap().push(name);
                async { Ok(Value::Null) }
            })
            .with_priority(priority)
            .with_label(name);
            ids.push(queue.enqueue(spec).await.unwrap());
        }
        assert_eq!(queue.stats().queued, 5);

        gate_tx.send(()).unwrap();
        queue.wait(blocker).await.unwrap();
        for id in ids {
            queue.wait(id).await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["d", "c", "b", "e", "a"]);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_requeues_once_then_succeeds() {
        let queue = queue(1);
        let id = queue
            .enqueue(
                JobSpec::new(|ctx: JobContext| async move {
                    if ctx.attempt == 1 {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    Ok(Value::from(ctx.attempt))
                })
                .with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap();

        let record = queue.wait(id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.result, Some(Value::from(2)));
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_timeout_fails_job() {
        let queue = queue(1);
        let id = queue
            .enqueue(
                JobSpec::new(|_ctx| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                })
                .with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap();

        let record = queue.wait(id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempts, 2);
        assert!(matches!(record.error, Some(WorkerError::Timeout { .. })));
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_requeue_fails_immediately() {
        let queue = JobQueue::start(
            QueueConfig {
                workers: 1,
                requeue_on_timeout: false,
                default_timeout_ms: Some(100),
            },
            None,
        );
        let id = queue
            .enqueue(JobSpec::new(|_ctx| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }))
            .await
            .unwrap();
        let record = queue.wait(id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempts, 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_queued_job_never_runs() {
        let queue = queue(1);
        let (started_tx, started_rx) = oneshot::channel();
        let (gate_tx, gate_rx) = oneshot::channel();
        let blocker = queue.enqueue(gated(started_tx, gate_rx)).await.unwrap();
        started_rx.await.unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in = ran.clone();
        let victim = queue
            .enqueue(JobSpec::new(move |_ctx| {
                ran_in.fetch_add(1, Ordering::SeqCst);
                async { Ok(Value::Null) }
            }))
            .await
            .unwrap();

        assert!(queue.cancel(victim).await);
        assert_eq!(queue.status(victim), Some(JobStatus::Cancelled));
        assert!(!queue.cancel(victim).await, "already terminal");

        gate_tx.send(()).unwrap();
        queue.wait(blocker).await.unwrap();
        assert_eq!(queue.wait(victim).await.unwrap().attempts, 0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_running_job_signals_token() {
        let queue = queue(1);
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let started_tx = Mutex::new(Some(started_tx));
        let id = queue
            .enqueue(JobSpec::new(move |ctx: JobContext| {
                if let Some(tx) = started_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                async move {
                    ctx.cancel.cancelled().await;
                    Err(WorkerError::cancelled("observed"))
                }
            }))
            .await
            .unwrap();
        started_rx.await.unwrap();

        assert!(queue.cancel(id).await);
        let record = queue.wait(id).await.unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert_eq!(queue.stats().running, 0);
        queue.shutdown().await;
    }

    async fn explode() -> Result<Value, WorkerError> {
        panic!("job bug")
    }

    #[tokio::test]
    async fn test_panicking_job_fails_and_worker_survives() {
        let queue = queue(1);
        let broken = queue.enqueue(JobSpec::new(|_ctx| explode())).await.unwrap();

        let record = queue.wait(broken).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error, Some(WorkerError::failed("job panicked")));
        assert!(record.finished_at.is_some());

        // The single worker is still alive and picks up the next job.
        let next = queue
            .enqueue(JobSpec::new(|_ctx| async { Ok(Value::from("after")) }))
            .await
            .unwrap();
        let record = queue.wait(next).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.result, Some(Value::from("after")));

        let stats = queue.stats();
        assert_eq!(stats.running, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversized_timeout_saturates() {
        let queue = queue(1);
        let id = queue
            .enqueue(JobSpec::new(|_ctx| async { Ok(Value::Null) }).with_timeout(Duration::MAX))
            .await
            .unwrap();
        let record = queue.wait(id).await.unwrap();
        assert_eq!(record.timeout_ms, Some(u64::MAX));
        assert_eq!(record.status, JobStatus::Completed);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let queue = queue(1);
        let missing = Uuid::now_v7();
        assert!(!queue.cancel(missing).await);
        assert_eq!(queue.status(missing), None);
        assert!(matches!(
            queue.wait(missing).await,
            Err(QueueError::NotFound(_))
        ));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_and_rejects_new_jobs() {
        let queue = queue(1);
        let (started_tx, started_rx) = oneshot::channel();
        let (_gate_tx, gate_rx) = oneshot::channel();
        let blocker = queue.enqueue(gated(started_tx, gate_rx)).await.unwrap();
        started_rx.await.unwrap();
        let queued = queue
            .enqueue(JobSpec::new(|_ctx| async { Ok(Value::Null) }))
            .await
            .unwrap();

        queue.shutdown().await;
        assert_eq!(queue.status(blocker), Some(JobStatus::Cancelled));
        assert_eq!(queue.status(queued), Some(JobStatus::Cancelled));
        assert!(matches!(
            queue
                .enqueue(JobSpec::new(|_ctx| async { Ok(Value::Null) }))
                .await,
            Err(QueueError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_events_published() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_channel(
            EventFilter::kinds([
                EventKind::JobEnqueued,
                EventKind::JobStarted,
                EventKind::JobFinished,
            ]),
            16,
        );
        let queue = JobQueue::start(QueueConfig::default().with_workers(1), Some(bus));
        let id = queue
            .enqueue(JobSpec::new(|_ctx| async { Err(WorkerError::failed("boom")) }))
            .await
            .unwrap();
        queue.wait(id).await.unwrap();

        let mut kinds = Vec::new();
        while kinds.len() < 3 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.correlation_id, id);
            if let EventPayload::JobFinished { status, error, .. } = &event.payload {
                assert_eq!(*status, JobStatus::Failed);
                assert!(error.as_deref().unwrap().contains("boom"));
            }
            kinds.push(event.kind);
        }
        assert!(kinds.contains(&EventKind::JobEnqueued));
        assert!(kinds.contains(&EventKind::JobStarted));
        assert!(kinds.contains(&EventKind::JobFinished));
        queue.shutdown().await;
    }
}
