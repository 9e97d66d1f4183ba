//! `StepRunner` adapter that runs every step attempt as a queued job.
//!
//! The executor bounds concurrency within one run; routing attempts through
//! a shared `JobQueue` adds a ceiling across every run using the same queue.

use std::sync::Arc;

use stepflow_types::job::{JobPriority, JobStatus};
use stepflow_types::worker::{WorkerError, WorkerOutput};
use stepflow_types::workflow::Step;

use super::job_queue::{JobContext, JobQueue, JobSpec};
use crate::workflow::runner::{StepContext, StepRunner};

pub struct QueuedRunner<R: StepRunner> {
    inner: Arc<R>,
    queue: Arc<JobQueue>,
    priority: JobPriority,
}

impl<R: StepRunner> QueuedRunner<R> {
    pub fn new(inner: R, queue: Arc<JobQueue>) -> Self {
        Self {
            inner: Arc::new(inner),
            queue,
            priority: JobPriority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }
}

impl<R: StepRunner> StepRunner for QueuedRunner<R> {
    async fn run_step(&self, step: &Step, ctx: StepContext) -> Result<WorkerOutput, WorkerError> {
        let step_cancel = ctx.cancel.clone();
        let inner = Arc::clone(&self.inner);
        let job_step = step.clone();

        let spec = JobSpec::new(move |job: JobContext| {
            let inner = Arc::clone(&inner);
            let step = job_step.clone();
            let mut ctx = ctx.clone();
            async move {
                // Timeout or cancellation of the job stops the step too.
                let linked = ctx.cancel.child_token();
                let job_cancel = job.cancel.clone();
                let stop_step = linked.clone();
                // Aborted on drop, including when the step panics.
                let mut forward = tokio::task::JoinSet::new();
                forward.spawn(async move {
                    job_cancel.cancelled().await;
                    stop_step.cancel();
                });
                ctx.cancel = linked;

                let output = inner.run_step(&step, ctx).await?;
                serde_json::to_value(output)
                    .map_err(|e| WorkerError::failed(format!("serialize step output: {e}")))
            }
        })
        .with_priority(self.priority)
        .with_label(format!("step {}", step.id));

        let job_id = self
            .queue
            .enqueue(spec)
            .await
            .map_err(|e| WorkerError::failed(e.to_string()))?;

        let record = tokio::select! {
            record = self.queue.wait(job_id) => {
                record.map_err(|e| WorkerError::failed(e.to_string()))?
            }
            _ = step_cancel.cancelled() => {
                self.queue.cancel(job_id).await;
                return Err(WorkerError::cancelled("run cancelled while step was queued or running"));
            }
        };

        match record.status {
            JobStatus::Completed => {
                let value = record.result.unwrap_or_default();
                serde_json::from_value(value)
                    .map_err(|e| WorkerError::failed(format!("decode step output: {e}")))
            }
            JobStatus::Failed => Err(record
                .error
                .unwrap_or_else(|| WorkerError::failed("job failed without an error"))),
            JobStatus::Cancelled => Err(WorkerError::cancelled("job cancelled")),
            other => Err(WorkerError::failed(format!(
                "job ended in non-terminal status {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use stepflow_types::config::{ExecutorConfig, QueueConfig, RetryConfig};
    use stepflow_types::workflow::{Plan, StepStatus, WorkerKind};
    use tokio_util::sync::CancellationToken;

    use crate::event::bus::EventBus;
    use crate::workflow::executor::ParallelExecutor;
    use crate::workflow::retry::RetryManager;
    use crate::workflow::runner::FnRunner;

    type BoxResult = Pin<Box<dyn Future<Output = Result<WorkerOutput, WorkerError>> + Send>>;

    #[tokio::test(start_paused = true)]
    async fn test_queue_caps_concurrency_across_wide_plan() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        let inner = FnRunner(move |step: Step, _ctx: StepContext| -> BoxResult {
            let running = r.clone();
            let peak = p.clone();
            Box::pin(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(WorkerOutput::text(format!("step {}", step.id)))
            })
        });

        let queue = Arc::new(JobQueue::start(QueueConfig::default().with_workers(1), None));
        let exec = ParallelExecutor::new(
            QueuedRunner::new(inner, queue.clone()),
            RetryManager::new(RetryConfig::disabled()),
            EventBus::default(),
            ExecutorConfig::default().with_concurrency(4),
        );
        let steps = (1..=4)
            .map(|id| Step::new(id, format!("step {id}"), WorkerKind::Coder))
            .collect();
        let result = exec
            .run(&Plan::new("wide", steps), CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.output(3).unwrap().output, "step 3");
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().completed, 4);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_error_passes_through() {
        let queue = Arc::new(JobQueue::start(QueueConfig::default().with_workers(2), None));
        let runner = QueuedRunner::new(
            FnRunner(|_step: Step, _ctx: StepContext| -> BoxResult {
                Box::pin(async { Err(WorkerError::network("connection refused")) })
            }),
            queue.clone(),
        )
        .with_priority(JobPriority::High);

        let plan = Plan::new("x", vec![Step::new(1, "only", WorkerKind::Tester)]);
        let ctx = StepContext::new(uuid::Uuid::now_v7(), &plan);
        let err = runner.run_step(&plan.steps[0], ctx).await.unwrap_err();
        assert!(matches!(err, WorkerError::Network { .. }));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_step_fails_without_stalling_run() {
        let queue = Arc::new(JobQueue::start(QueueConfig::default().with_workers(1), None));
        let inner = FnRunner(|step: Step, _ctx: StepContext| -> BoxResult {
            Box::pin(async move {
                if step.id == 2 {
                    panic!("worker bug in step 2");
                }
                Ok(WorkerOutput::text(format!("step {}", step.id)))
            })
        });
        let exec = ParallelExecutor::new(
            QueuedRunner::new(inner, queue.clone()),
            RetryManager::new(RetryConfig::default()),
            EventBus::default(),
            ExecutorConfig::default().with_concurrency(2),
        );
        let plan = Plan::new(
            "panics",
            vec![
                Step::new(1, "fine", WorkerKind::Coder),
                Step::new(2, "broken", WorkerKind::Coder),
                Step::new(3, "after", WorkerKind::Coder).depends_on([2]),
            ],
        );
        let result = exec.run(&plan, CancellationToken::new()).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.status(1), Some(StepStatus::Completed));
        assert_eq!(result.status(2), Some(StepStatus::Failed));
        assert_eq!(result.steps[&2].attempts, 1, "a panic is not retried");
        assert_eq!(result.steps[&2].error.as_deref(), Some("worker failed: job panicked"));
        assert_eq!(result.status(3), Some(StepStatus::Skipped));
        assert_eq!(queue.stats().running, 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_step_cancellation_cancels_job() {
        let queue = Arc::new(JobQueue::start(QueueConfig::default().with_workers(1), None));
        let runner = QueuedRunner::new(
            FnRunner(|_step: Step, ctx: StepContext| -> BoxResult {
                Box::pin(async move {
                    ctx.cancel.cancelled().await;
                    Err(WorkerError::cancelled("stopped"))
                })
            }),
            queue.clone(),
        );
        let plan = Plan::new("x", vec![Step::new(1, "only", WorkerKind::Coder)]);
        let ctx = StepContext::new(uuid::Uuid::now_v7(), &plan);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            cancel.cancel();
        });

        let err = runner.run_step(&plan.steps[0], ctx).await.unwrap_err();
        assert!(matches!(err, WorkerError::Cancelled { .. }));
        queue.shutdown().await;
        assert_eq!(queue.stats().running, 0);
    }
}
