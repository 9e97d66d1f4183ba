//! Per-run execution state.
//!
//! `ExecutionState` is the single source of truth for each step's status,
//! attempts, output and last error within one run. The executor owns it and
//! mutates it only through the transition methods below; observers receive
//! read-only `RunSnapshot`s.
//!
//! Allowed transitions:
//!
//! ```text
//! Pending -> Running -> Completed
//!                    -> Failed
//!                    -> Running (retry scheduled, re-dispatched later)
//! Pending -> Skipped
//! ```

use std::collections::BTreeMap;

use stepflow_types::worker::WorkerOutput;
use stepflow_types::workflow::{
    Plan, RunSnapshot, RunStatus, StepId, StepSnapshot, StepStatus, WorkflowCheckpoint,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("unknown step {0}")]
    UnknownStep(StepId),

    #[error("invalid transition for step {step}: {from} -> {to}")]
    InvalidTransition {
        step: StepId,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("checkpoint does not match plan: {0}")]
    CheckpointMismatch(String),
}

/// Number of steps in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
struct StepRecord {
    snapshot: StepSnapshot,
    /// Running but waiting on a backoff timer rather than executing.
    retry_pending: bool,
}

impl StepRecord {
    fn new(snapshot: StepSnapshot) -> Self {
        Self {
            snapshot,
            retry_pending: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionState {
    run_id: Uuid,
    plan_id: Uuid,
    steps: BTreeMap<StepId, StepRecord>,
    cancelled: bool,
}

impl ExecutionState {
    /// Fresh state for `plan` with every step Pending.
    pub fn new(plan: &Plan) -> Self {
        Self::with_run_id(plan, Uuid::now_v7())
    }

    pub fn with_run_id(plan: &Plan, run_id: Uuid) -> Self {
        Self {
            run_id,
            plan_id: plan.id,
            steps: plan
                .steps
                .iter()
                .map(|s| (s.id, StepRecord::new(StepSnapshot::pending())))
                .collect(),
            cancelled: false,
        }
    }

    /// Rehydrate state from a checkpoint taken during an earlier run of `plan`.
    ///
    /// Steps that were Running when the checkpoint was taken go back to
    /// Pending (their attempt count is kept). Terminal steps keep their
    /// status and output.
    pub fn from_checkpoint(plan: &Plan, checkpoint: &WorkflowCheckpoint) -> Result<Self, StateError> {
        if checkpoint.plan_id != plan.id {
            return Err(StateError::CheckpointMismatch(format!(
                "checkpoint plan {} != plan {}",
                checkpoint.plan_id, plan.id
            )));
        }
        let plan_steps = plan.step_ids();
        let checkpoint_steps: std::collections::BTreeSet<StepId> =
            checkpoint.steps.keys().copied().collect();
        if plan_steps != checkpoint_steps {
            return Err(StateError::CheckpointMismatch(format!(
                "plan steps {plan_steps:?} != checkpoint steps {checkpoint_steps:?}"
            )));
        }

        let steps = checkpoint
            .steps
            .iter()
            .map(|(id, snap)| {
                let mut snap = snap.clone();
                if snap.status == StepStatus::Running {
                    snap.status = StepStatus::Pending;
                }
                (*id, StepRecord::new(snap))
            })
            .collect();

        Ok(Self {
            run_id: checkpoint.run_id,
            plan_id: plan.id,
            steps,
            cancelled: false,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn plan_id(&self) -> Uuid {
        self.plan_id
    }

    pub fn status(&self, id: StepId) -> Option<StepStatus> {
        self.steps.get(&id).map(|r| r.snapshot.status)
    }

    pub fn attempts(&self, id: StepId) -> u32 {
        self.steps.get(&id).map_or(0, |r| r.snapshot.attempts)
    }

    pub fn output(&self, id: StepId) -> Option<&WorkerOutput> {
        self.steps.get(&id).and_then(|r| r.snapshot.output.as_ref())
    }

    pub fn last_error(&self, id: StepId) -> Option<&str> {
        self.steps.get(&id).and_then(|r| r.snapshot.error.as_deref())
    }

    pub fn is_retry_pending(&self, id: StepId) -> bool {
        self.steps.get(&id).is_some_and(|r| r.retry_pending)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Dispatch a step: Pending -> Running, or re-dispatch a step whose retry
    /// timer fired. Increments the attempt counter either way.
    pub fn start(&mut self, id: StepId) -> Result<u32, StateError> {
        let record = self.record_mut(id)?;
        match record.snapshot.status {
            StepStatus::Pending => {}
            StepStatus::Running if record.retry_pending => record.retry_pending = false,
            from => {
                return Err(StateError::InvalidTransition {
                    step: id,
                    from,
                    to: StepStatus::Running,
                });
            }
        }
        record.snapshot.status = StepStatus::Running;
        record.snapshot.attempts += 1;
        Ok(record.snapshot.attempts)
    }

    /// Note a failed attempt that will be retried. The step stays Running.
    pub fn record_retry(&mut self, id: StepId, error: impl Into<String>) -> Result<(), StateError> {
        let record = self.running_record(id, StepStatus::Running)?;
        record.retry_pending = true;
        record.snapshot.error = Some(error.into());
        Ok(())
    }

    pub fn complete(&mut self, id: StepId, output: WorkerOutput) -> Result<(), StateError> {
        let record = self.running_record(id, StepStatus::Completed)?;
        record.retry_pending = false;
        record.snapshot.status = StepStatus::Completed;
        record.snapshot.output = Some(output);
        record.snapshot.error = None;
        Ok(())
    }

    pub fn fail(&mut self, id: StepId, error: impl Into<String>) -> Result<(), StateError> {
        let record = self.running_record(id, StepStatus::Failed)?;
        record.retry_pending = false;
        record.snapshot.status = StepStatus::Failed;
        record.snapshot.error = Some(error.into());
        Ok(())
    }

    pub fn skip(&mut self, id: StepId, reason: impl Into<String>) -> Result<(), StateError> {
        let record = self.record_mut(id)?;
        if record.snapshot.status != StepStatus::Pending {
            return Err(StateError::InvalidTransition {
                step: id,
                from: record.snapshot.status,
                to: StepStatus::Skipped,
            });
        }
        record.snapshot.status = StepStatus::Skipped;
        record.snapshot.error = Some(reason.into());
        Ok(())
    }

    /// Flag the run as cancelled. Affects only the derived run status.
    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn step_ids_with_status(&self, status: StepStatus) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|(_, r)| r.snapshot.status == status)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.steps.values() {
            match record.snapshot.status {
                StepStatus::Pending => counts.pending += 1,
                StepStatus::Running => counts.running += 1,
                StepStatus::Completed => counts.completed += 1,
                StepStatus::Failed => counts.failed += 1,
                StepStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    /// Every step has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.steps.values().all(|r| r.snapshot.status.is_terminal())
    }

    /// Terminal, not cancelled, and no step Failed.
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.is_terminal()
            && !self
                .steps
                .values()
                .any(|r| r.snapshot.status == StepStatus::Failed)
    }

    pub fn run_status(&self) -> RunStatus {
        if !self.is_terminal() {
            RunStatus::Running
        } else if self.cancelled {
            RunStatus::Cancelled
        } else if self.is_success() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id,
            plan_id: self.plan_id,
            status: self.run_status(),
            steps: self.step_snapshots(),
        }
    }

    pub fn step_snapshots(&self) -> BTreeMap<StepId, StepSnapshot> {
        self.steps
            .iter()
            .map(|(id, r)| (*id, r.snapshot.clone()))
            .collect()
    }

    fn record_mut(&mut self, id: StepId) -> Result<&mut StepRecord, StateError> {
        self.steps.get_mut(&id).ok_or(StateError::UnknownStep(id))
    }

    fn running_record(&mut self, id: StepId, to: StepStatus) -> Result<&mut StepRecord, StateError> {
        let record = self.record_mut(id)?;
        if record.snapshot.status != StepStatus::Running {
            return Err(StateError::InvalidTransition {
                step: id,
                from: record.snapshot.status,
                to,
            });
        }
        Ok(record)
    }
}
