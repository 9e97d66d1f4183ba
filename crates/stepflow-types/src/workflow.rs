//! Workflow domain types for Stepflow.
//!
//! A `Plan` is the immutable input to a run: an ordered list of `Step`s with
//! declared dependencies. Execution tracking types (`StepSnapshot`,
//! `RunSnapshot`, `WorkflowCheckpoint`, `RunResult`) describe the per-step
//! state the executor owns while a run is in flight and the record it hands
//! back or persists afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::worker::{TokenUsage, WorkerOutput};

/// Step identifier. Unique within a plan and the tie-break for dispatch order.
pub type StepId = u32;

// ---------------------------------------------------------------------------
// Plan / Step
// ---------------------------------------------------------------------------

/// The kind of worker a step is assigned to.
///
/// Closed set of variants; the dispatcher routes on this tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Planner,
    Coder,
    Tester,
    Reviewer,
    Researcher,
    /// A worker registered under a caller-chosen name.
    Custom(String),
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Planner => write!(f, "planner"),
            WorkerKind::Coder => write!(f, "coder"),
            WorkerKind::Tester => write!(f, "tester"),
            WorkerKind::Reviewer => write!(f, "reviewer"),
            WorkerKind::Researcher => write!(f, "researcher"),
            WorkerKind::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// A single unit of planned work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub description: String,
    /// Worker kind that executes this step.
    pub worker: WorkerKind,
    /// Tool names the worker needs for this step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    /// Step IDs this step depends on (DAG edges).
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<StepId>,
}

impl Step {
    pub fn new(id: StepId, description: impl Into<String>, worker: WorkerKind) -> Self {
        Self {
            id,
            description: description.into(),
            worker,
            tools: Vec::new(),
            depends_on: BTreeSet::new(),
        }
    }

    pub fn depends_on(mut self, deps: impl IntoIterator<Item = StepId>) -> Self {
        self.depends_on.extend(deps);
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tools.extend(tools.into_iter().map(Into::into));
        self
    }
}

/// Optional cost estimate attached by the planner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanEstimate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// An ordered sequence of steps working toward a goal.
///
/// Immutable once execution starts. Run status is derived from execution
/// state, never stored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// UUIDv7 assigned when the plan is created (or parsed without one).
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// What the plan is trying to achieve; forwarded to workers.
    pub goal: String,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<PlanEstimate>,
    /// Files relevant to the task, forwarded to workers as context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relevant_files: Vec<String>,
    /// Free-form constraints forwarded to workers as context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
}

impl Plan {
    pub fn new(goal: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: Uuid::now_v7(),
            goal: goal.into(),
            steps,
            estimate: None,
            relevant_files: Vec::new(),
            constraints: Vec::new(),
        }
    }

    /// Look up a step by ID.
    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_ids(&self) -> BTreeSet<StepId> {
        self.steps.iter().map(|s| s.id).collect()
    }
}

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Snapshots, checkpoints, results
// ---------------------------------------------------------------------------

/// Read-only view of one step's execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub status: StepStatus,
    /// Number of times the step has been dispatched (1-based once started).
    pub attempts: u32,
    #[serde(default)]
    pub output: Option<WorkerOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepSnapshot {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            output: None,
            error: None,
        }
    }
}

/// Read-only view of a run's execution state, published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub plan_id: Uuid,
    pub status: RunStatus,
    pub steps: BTreeMap<StepId, StepSnapshot>,
}

/// Persisted snapshot used to audit or resume a run.
///
/// Never mutated after being written; a newer checkpoint supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub run_id: Uuid,
    pub plan_id: Uuid,
    pub run_status: RunStatus,
    pub steps: BTreeMap<StepId, StepSnapshot>,
    /// Sequence number of the event that triggered this checkpoint.
    pub last_event_seq: u64,
    pub created_at: DateTime<Utc>,
}

impl WorkflowCheckpoint {
    pub fn from_snapshot(snapshot: &RunSnapshot, last_event_seq: u64) -> Self {
        Self {
            run_id: snapshot.run_id,
            plan_id: snapshot.plan_id,
            run_status: snapshot.status,
            steps: snapshot.steps.clone(),
            last_event_seq,
            created_at: Utc::now(),
        }
    }

    /// IDs of steps already completed; these are never re-run on resume.
    pub fn completed_steps(&self) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|(_, s)| s.status == StepStatus::Completed)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Final outcome of a run, aggregated by step ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub plan_id: Uuid,
    /// True when every step completed (no step Failed, run not cancelled).
    pub success: bool,
    pub cancelled: bool,
    pub steps: BTreeMap<StepId, StepSnapshot>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Checkpoint writes that failed during the run, in event order. A run
    /// with entries here may not be resumable from its latest checkpoint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoint_errors: Vec<String>,
}

impl RunResult {
    pub fn status(&self, id: StepId) -> Option<StepStatus> {
        self.steps.get(&id).map(|s| s.status)
    }

    pub fn output(&self, id: StepId) -> Option<&WorkerOutput> {
        self.steps.get(&id).and_then(|s| s.output.as_ref())
    }

    pub fn steps_with_status(&self, status: StepStatus) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|(_, s)| s.status == status)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Sum of token/cost usage reported by completed steps.
    pub fn total_usage(&self) -> TokenUsage {
        self.steps
            .values()
            .filter_map(|s| s.output.as_ref().and_then(|o| o.usage.as_ref()))
            .fold(TokenUsage::default(), |acc, u| acc.combine(u))
    }

    /// True when every checkpoint the run attempted was written.
    pub fn is_persisted(&self) -> bool {
        self.checkpoint_errors.is_empty()
    }

    pub fn run_status(&self) -> RunStatus {
        if self.cancelled {
            RunStatus::Cancelled
        } else if self.success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
