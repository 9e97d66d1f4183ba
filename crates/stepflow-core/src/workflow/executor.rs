//! Parallel executor: dependency-aware step scheduling with bounded concurrency.
//!
//! `ParallelExecutor` drives one run of a plan. A single scheduling loop owns
//! the `ExecutionState`; step attempts run on a `JoinSet` bounded by
//! `concurrency_limit`. Retries wait on a `DelayQueue` and hold no slot while
//! their backoff is pending.
//!
//! # Scheduling pass
//!
//! 1. Skip every Pending step that an upstream failure has made unreachable.
//! 2. Dispatch retries whose timer fired, then ready steps (ascending ID),
//!    while slots remain.
//! 3. Wait for an attempt to finish, a retry timer to fire, or cancellation.
//! 4. Record the outcome (Completed, retry scheduled, or Failed) and publish
//!    the transition on the event bus.
//!
//! The loop ends once no step is Pending or Running.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use stepflow_types::config::ExecutorConfig;
use stepflow_types::event::{Event, EventPayload};
use stepflow_types::worker::{WorkerError, WorkerOutput};
use stepflow_types::workflow::{Plan, RunResult, StepId, StepStatus, WorkflowCheckpoint};
use thiserror::Error;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;

use crate::event::bus::EventBus;

use super::dag::DependencyGraph;
use super::plan::PlanError;
use super::retry::{RetryDecision, RetryManager};
use super::runner::{StepContext, StepRunner};
use super::state::{ExecutionState, StateError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Structural failures that prevent a run from executing at all.
///
/// Step failures are not errors here; they are recorded in the `RunResult`.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("invalid plan: {0}")]
    InvalidPlan(#[from] PlanError),

    #[error("checkpoint does not match plan: {0}")]
    CheckpointMismatch(String),

    #[error("execution state error: {0}")]
    State(StateError),
}

impl From<StateError> for ExecutorError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::CheckpointMismatch(msg) => ExecutorError::CheckpointMismatch(msg),
            other => ExecutorError::State(other),
        }
    }
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// ParallelExecutor
// ---------------------------------------------------------------------------

/// Runs plans with bounded parallelism, retries, and lifecycle events.
///
/// Generic over `R: StepRunner`; the runner is shared by every attempt.
pub struct ParallelExecutor<R: StepRunner> {
    runner: Arc<R>,
    retry: Arc<RetryManager>,
    bus: EventBus,
    config: ExecutorConfig,
}

impl<R: StepRunner> ParallelExecutor<R> {
    pub fn new(runner: R, retry: RetryManager, bus: EventBus, config: ExecutorConfig) -> Self {
        Self {
            runner: Arc::new(runner),
            retry: Arc::new(retry),
            bus,
            config,
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute `plan` from the beginning.
    ///
    /// Cancelling `cancel` stops new dispatch, skips Pending steps and gives
    /// in-flight attempts `cancel_grace` to finish.
    pub async fn run(
        &self,
        plan: &Plan,
        cancel: CancellationToken,
    ) -> Result<RunResult, ExecutorError> {
        let graph = DependencyGraph::build(&plan.steps)?;
        let state = ExecutionState::new(plan);
        RunLoop::new(self, plan, graph, state, cancel).drive(false).await
    }

    /// Continue a run from its latest checkpoint.
    ///
    /// Completed steps keep their output and are never re-run; steps that
    /// were Running when the checkpoint was taken start again.
    pub async fn resume(
        &self,
        plan: &Plan,
        checkpoint: &WorkflowCheckpoint,
        cancel: CancellationToken,
    ) -> Result<RunResult, ExecutorError> {
        let graph = DependencyGraph::build(&plan.steps)?;
        let state = ExecutionState::from_checkpoint(plan, checkpoint)?;
        self.bus.resume_sequence_from(checkpoint.last_event_seq);
        tracing::info!(
            run_id = %checkpoint.run_id,
            seq = checkpoint.last_event_seq,
            completed = checkpoint.completed_steps().len(),
            "resuming run from checkpoint"
        );
        RunLoop::new(self, plan, graph, state, cancel).drive(true).await
    }
}

impl<R: StepRunner> std::fmt::Debug for ParallelExecutor<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelExecutor")
            .field("config", &self.config)
            .field("bus", &self.bus)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

/// Result of one attempt, produced by the spawned task.
struct AttemptOutcome {
    step_id: StepId,
    attempt: u32,
    elapsed: Duration,
    result: Result<WorkerOutput, WorkerError>,
}

enum Wake {
    Cancelled,
    Joined(Result<(TaskId, AttemptOutcome), JoinError>),
    RetryDue(StepId),
}

struct RunLoop<'a, R: StepRunner> {
    exec: &'a ParallelExecutor<R>,
    plan: &'a Plan,
    graph: DependencyGraph,
    state: ExecutionState,
    cancel: CancellationToken,
    in_flight: JoinSet<AttemptOutcome>,
    tasks: HashMap<TaskId, StepId>,
    retries: DelayQueue<StepId>,
    due_retries: VecDeque<StepId>,
    started: Instant,
    checkpoint_errors: Vec<String>,
}

impl<'a, R: StepRunner> RunLoop<'a, R> {
    fn new(
        exec: &'a ParallelExecutor<R>,
        plan: &'a Plan,
        graph: DependencyGraph,
        state: ExecutionState,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            exec,
            plan,
            graph,
            state,
            cancel,
            in_flight: JoinSet::new(),
            tasks: HashMap::new(),
            retries: DelayQueue::new(),
            due_retries: VecDeque::new(),
            started: Instant::now(),
            checkpoint_errors: Vec::new(),
        }
    }

    async fn drive(mut self, resumed: bool) -> Result<RunResult, ExecutorError> {
        let started_at = Utc::now();
        let run_id = self.state.run_id();
        tracing::info!(
            run_id = %run_id,
            plan_id = %self.plan.id,
            steps = self.plan.steps.len(),
            concurrency = self.exec.config.concurrency_limit,
            resumed,
            "workflow run started"
        );
        self.publish(EventPayload::RunStarted {
            plan_id: self.plan.id,
            goal: self.plan.goal.clone(),
            total_steps: self.plan.steps.len(),
            resumed,
        })
        .await;

        loop {
            if self.cancel.is_cancelled() {
                self.cancel_run().await?;
                break;
            }

            self.propagate_skips().await?;
            self.dispatch().await?;

            if self.state.is_terminal() {
                break;
            }
            if self.in_flight.is_empty() && self.retries.is_empty() && self.due_retries.is_empty() {
                self.skip_stranded().await?;
                continue;
            }

            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                Some(joined) = self.in_flight.join_next_with_id(), if !self.in_flight.is_empty() => {
                    Wake::Joined(joined)
                }
                Some(expired) = self.retries.next(), if !self.retries.is_empty() => {
                    Wake::RetryDue(expired.into_inner())
                }
            };

            match wake {
                Wake::Cancelled => {}
                Wake::Joined(joined) => self.on_joined(joined, false).await?,
                Wake::RetryDue(step_id) => self.due_retries.push_back(step_id),
            }
        }

        self.finish(started_at).await
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn free_slots(&self) -> usize {
        self.exec
            .config
            .concurrency_limit
            .max(1)
            .saturating_sub(self.in_flight.len())
    }

    async fn dispatch(&mut self) -> Result<(), ExecutorError> {
        while self.free_slots() > 0 {
            let Some(step_id) = self.due_retries.pop_front() else {
                break;
            };
            self.launch(step_id).await?;
        }

        if self.free_slots() == 0 {
            return Ok(());
        }
        let ready = self.graph.ready(&self.state);
        for step_id in ready.into_iter().take(self.free_slots()) {
            self.launch(step_id).await?;
        }
        Ok(())
    }

    async fn launch(&mut self, step_id: StepId) -> Result<(), ExecutorError> {
        let Some(step) = self.plan.step(step_id).cloned() else {
            return Err(StateError::UnknownStep(step_id).into());
        };
        let attempt = self.state.start(step_id)?;

        let mut ctx = StepContext::new(self.state.run_id(), self.plan);
        ctx.attempt = attempt;
        ctx.cancel = self.cancel.child_token();
        ctx.dependency_outputs = self
            .graph
            .dependencies(step_id)
            .filter_map(|dep| self.state.output(dep).map(|out| (dep, out.clone())))
            .collect::<BTreeMap<_, _>>();

        tracing::debug!(
            run_id = %self.state.run_id(),
            step_id,
            attempt,
            worker = %step.worker,
            "dispatching step"
        );
        self.publish(EventPayload::StepStarted {
            step_id,
            attempt,
            worker: step.worker.clone(),
        })
        .await;

        let runner = Arc::clone(&self.exec.runner);
        let timeout = self.exec.config.step_timeout();
        let handle = self.in_flight.spawn(async move {
            let start = Instant::now();
            let token = ctx.cancel.clone();
            let attempt_fut = runner.run_step(&step, ctx);
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt_fut).await {
                    Ok(result) => result,
                    Err(_) => {
                        token.cancel();
                        Err(WorkerError::timeout(limit))
                    }
                },
                None => attempt_fut.await,
            };
            AttemptOutcome {
                step_id: step.id,
                attempt,
                elapsed: start.elapsed(),
                result,
            }
        });
        self.tasks.insert(handle.id(), step_id);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Outcomes
    // -----------------------------------------------------------------------

    async fn on_joined(
        &mut self,
        joined: Result<(TaskId, AttemptOutcome), JoinError>,
        cancelling: bool,
    ) -> Result<(), ExecutorError> {
        match joined {
            Ok((task_id, outcome)) => {
                self.tasks.remove(&task_id);
                self.on_outcome(outcome, cancelling).await
            }
            Err(err) => {
                let Some(step_id) = self.tasks.remove(&err.id()) else {
                    return Ok(());
                };
                let attempt = self.state.attempts(step_id);
                let error = if err.is_panic() {
                    tracing::error!(run_id = %self.state.run_id(), step_id, "step worker panicked");
                    WorkerError::failed("worker panicked")
                } else {
                    WorkerError::cancelled("abandoned after cancel grace period")
                };
                self.fail_step(step_id, attempt, &error).await
            }
        }
    }

    async fn on_outcome(
        &mut self,
        outcome: AttemptOutcome,
        cancelling: bool,
    ) -> Result<(), ExecutorError> {
        let AttemptOutcome {
            step_id,
            attempt,
            elapsed,
            result,
        } = outcome;

        let error = match result {
            Ok(output) => {
                self.state.complete(step_id, output)?;
                tracing::debug!(
                    run_id = %self.state.run_id(),
                    step_id,
                    attempt,
                    duration_ms = as_millis(elapsed),
                    "step completed"
                );
                self.publish(EventPayload::StepCompleted {
                    step_id,
                    attempt,
                    duration_ms: as_millis(elapsed),
                })
                .await;
                return Ok(());
            }
            Err(error) => error,
        };

        let decision = if cancelling {
            RetryDecision::GiveUp
        } else {
            self.exec.retry.on_failure(&error, attempt.saturating_sub(1))
        };

        match decision {
            RetryDecision::Retry { delay } => {
                self.state.record_retry(step_id, error.to_string())?;
                self.retries.insert(step_id, delay);
                tracing::warn!(
                    run_id = %self.state.run_id(),
                    step_id,
                    attempt,
                    delay_ms = as_millis(delay),
                    error = %error,
                    "step failed, retrying"
                );
                self.publish(EventPayload::StepRetrying {
                    step_id,
                    attempt,
                    delay_ms: as_millis(delay),
                    error: error.to_string(),
                })
                .await;
                Ok(())
            }
            RetryDecision::GiveUp => self.fail_step(step_id, attempt, &error).await,
        }
    }

    async fn fail_step(
        &mut self,
        step_id: StepId,
        attempt: u32,
        error: &WorkerError,
    ) -> Result<(), ExecutorError> {
        self.state.fail(step_id, error.to_string())?;
        let blocked = self.graph.descendants(step_id).len();
        tracing::debug!(
            run_id = %self.state.run_id(),
            step_id,
            attempt,
            blocked,
            error = %error,
            "step failed"
        );
        self.publish(EventPayload::StepFailed {
            step_id,
            attempt,
            error: error.to_string(),
        })
        .await;
        Ok(())
    }

    async fn skip_step(&mut self, step_id: StepId, reason: String) -> Result<(), ExecutorError> {
        self.state.skip(step_id, reason.clone())?;
        tracing::debug!(run_id = %self.state.run_id(), step_id, reason = %reason, "step skipped");
        self.publish(EventPayload::StepSkipped { step_id, reason }).await;
        Ok(())
    }

    /// Skip every Pending step blocked by a Failed or Skipped dependency.
    async fn propagate_skips(&mut self) -> Result<(), ExecutorError> {
        for step_id in self.graph.skippable(&self.state) {
            let blocker = self.graph.dependencies(step_id).find(|dep| {
                matches!(
                    self.state.status(*dep),
                    Some(StepStatus::Failed) | Some(StepStatus::Skipped)
                )
            });
            let reason = match blocker {
                Some(dep) => format!("dependency {dep} did not complete"),
                None => "upstream dependency did not complete".to_string(),
            };
            self.skip_step(step_id, reason).await?;
        }
        Ok(())
    }

    /// Nothing running, nothing waiting, yet steps remain Pending. Only
    /// reachable if the graph and state disagree; skip what is left so the
    /// run still terminates.
    async fn skip_stranded(&mut self) -> Result<(), ExecutorError> {
        for step_id in self.state.step_ids_with_status(StepStatus::Pending) {
            tracing::error!(run_id = %self.state.run_id(), step_id, "step can never become ready");
            self.skip_step(step_id, "unreachable".to_string()).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    async fn cancel_run(&mut self) -> Result<(), ExecutorError> {
        self.state.mark_cancelled();
        tracing::info!(
            run_id = %self.state.run_id(),
            in_flight = self.in_flight.len(),
            "cancelling run"
        );

        // Attempts waiting on a backoff timer will never run.
        let waiting: Vec<StepId> = self
            .state
            .step_ids_with_status(StepStatus::Running)
            .into_iter()
            .filter(|id| self.state.is_retry_pending(*id))
            .collect();
        self.retries.clear();
        self.due_retries.clear();
        for step_id in waiting {
            let attempt = self.state.attempts(step_id);
            self.fail_step(step_id, attempt, &WorkerError::cancelled("run cancelled before retry"))
                .await?;
        }

        for step_id in self.state.step_ids_with_status(StepStatus::Pending) {
            self.skip_step(step_id, "run cancelled".to_string()).await?;
        }

        // In-flight attempts saw their child token fire; give them the grace
        // period to wrap up.
        let deadline = Instant::now() + self.exec.config.cancel_grace();
        while !self.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, self.in_flight.join_next_with_id()).await {
                Ok(Some(joined)) => self.on_joined(joined, true).await?,
                Ok(None) | Err(_) => break,
            }
        }

        if !self.in_flight.is_empty() {
            tracing::warn!(
                run_id = %self.state.run_id(),
                abandoned = self.in_flight.len(),
                "cancel grace period elapsed, aborting in-flight steps"
            );
            self.in_flight.abort_all();
            while let Some(joined) = self.in_flight.join_next_with_id().await {
                self.on_joined(joined, true).await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    async fn finish(mut self, started_at: chrono::DateTime<Utc>) -> Result<RunResult, ExecutorError> {
        let duration_ms = as_millis(self.started.elapsed());
        let run_id = self.state.run_id();
        let counts = self.state.counts();

        let payload = if self.state.is_cancelled() {
            EventPayload::RunCancelled {
                reason: "cancellation requested".to_string(),
                completed_steps: self.state.step_ids_with_status(StepStatus::Completed),
            }
        } else if self.state.is_success() {
            EventPayload::RunCompleted {
                duration_ms,
                steps_completed: counts.completed,
            }
        } else {
            EventPayload::RunFailed {
                duration_ms,
                failed_steps: self.state.step_ids_with_status(StepStatus::Failed),
                skipped_steps: self.state.step_ids_with_status(StepStatus::Skipped),
            }
        };
        self.publish(payload).await;

        tracing::info!(
            run_id = %run_id,
            status = %self.state.run_status(),
            duration_ms,
            completed = counts.completed,
            failed = counts.failed,
            skipped = counts.skipped,
            checkpoint_errors = self.checkpoint_errors.len(),
            "workflow run finished"
        );

        // Nothing can still be running; make sure no timer outlives the run.
        self.retries.clear();
        Ok(RunResult {
            run_id,
            plan_id: self.plan.id,
            success: self.state.is_success(),
            cancelled: self.state.is_cancelled(),
            steps: self.state.step_snapshots(),
            started_at,
            finished_at: Utc::now(),
            checkpoint_errors: self.checkpoint_errors,
        })
    }

    /// Publish a transition. A failed checkpoint write does not stop the
    /// run; it is recorded on the `RunResult`.
    async fn publish(&mut self, payload: EventPayload) {
        let event = Event::new(self.state.run_id(), payload);
        let snapshot = self.state.snapshot();
        if let Err(err) = self.exec.bus.publish_with_snapshot(event, &snapshot).await {
            self.checkpoint_errors.push(err.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
