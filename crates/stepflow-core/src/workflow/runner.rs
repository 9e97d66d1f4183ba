//! Worker invocation seam.
//!
//! `StepRunner` is the single callback the executor uses to run a step.
//! `WorkerDispatcher` implements it by routing on the step's `WorkerKind` to
//! a registered `Worker`. Workers use RPITIT; the dispatcher stores them
//! behind the object-safe `WorkerDyn` (blanket-implemented for every
//! `Worker`) so different worker types can share one registry.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use stepflow_types::worker::{WorkerError, WorkerOutput};
use stepflow_types::workflow::{Plan, Step, StepId, WorkerKind};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Everything a worker gets besides the step itself.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: Uuid,
    pub goal: String,
    pub relevant_files: Vec<String>,
    pub constraints: Vec<String>,
    /// Outputs of the step's direct dependencies, all Completed.
    pub dependency_outputs: BTreeMap<StepId, WorkerOutput>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cancelled when the run is cancelled or the attempt times out.
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn new(run_id: Uuid, plan: &Plan) -> Self {
        Self {
            run_id,
            goal: plan.goal.clone(),
            relevant_files: plan.relevant_files.clone(),
            constraints: plan.constraints.clone(),
            dependency_outputs: BTreeMap::new(),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Runs one attempt of one step.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for the async method.
pub trait StepRunner: Send + Sync + 'static {
    fn run_step(
        &self,
        step: &Step,
        ctx: StepContext,
    ) -> impl Future<Output = Result<WorkerOutput, WorkerError>> + Send;
}

/// Adapts an async closure into a `StepRunner`.
pub struct FnRunner<F>(pub F);

impl<F, Fut> StepRunner for FnRunner<F>
where
    F: Fn(Step, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<WorkerOutput, WorkerError>> + Send,
{
    fn run_step(
        &self,
        step: &Step,
        ctx: StepContext,
    ) -> impl Future<Output = Result<WorkerOutput, WorkerError>> + Send {
        (self.0)(step.clone(), ctx)
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// A pluggable worker (planner, coder, tester...). Opaque to the engine.
pub trait Worker: Send + Sync {
    fn execute(
        &self,
        step: &Step,
        ctx: StepContext,
    ) -> impl Future<Output = Result<WorkerOutput, WorkerError>> + Send;
}

/// Object-safe version of [`Worker`] with boxed futures.
pub trait WorkerDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        step: &'a Step,
        ctx: StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<WorkerOutput, WorkerError>> + Send + 'a>>;
}

impl<T: Worker> WorkerDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        step: &'a Step,
        ctx: StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<WorkerOutput, WorkerError>> + Send + 'a>> {
        Box::pin(self.execute(step, ctx))
    }
}

// ---------------------------------------------------------------------------
// WorkerDispatcher
// ---------------------------------------------------------------------------

/// Routes each step to the worker registered for its `WorkerKind`.
///
/// A step whose kind has no registered worker fails permanently.
#[derive(Default, Clone)]
pub struct WorkerDispatcher {
    workers: HashMap<WorkerKind, Arc<dyn WorkerDyn>>,
}

impl WorkerDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<W: Worker + 'static>(mut self, kind: WorkerKind, worker: W) -> Self {
        self.workers.insert(kind, Arc::new(worker));
        self
    }

    pub fn is_registered(&self, kind: &WorkerKind) -> bool {
        self.workers.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &WorkerKind> {
        self.workers.keys()
    }
}

impl std::fmt::Debug for WorkerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerDispatcher")
            .field("kinds", &self.workers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StepRunner for WorkerDispatcher {
    async fn run_step(&self, step: &Step, ctx: StepContext) -> Result<WorkerOutput, WorkerError> {
        let Some(worker) = self.workers.get(&step.worker).cloned() else {
            tracing::warn!(step_id = step.id, worker = %step.worker, "no worker registered");
            return Err(WorkerError::failed(format!(
                "no worker registered for kind '{}'",
                step.worker
            )));
        };
        worker.execute_boxed(step, ctx).await
    }
}
