//! Plan parsing and structural validation.
//!
//! Converts YAML/JSON documents into a `Plan` and rejects plans the executor
//! cannot run: empty plans, duplicate step IDs, dangling dependencies and
//! dependency cycles.

use std::path::Path;

use stepflow_types::workflow::{Plan, StepId};
use thiserror::Error;

use super::dag::DependencyGraph;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Structural problems with a plan. Always fatal and never retried.
#[derive(Debug, Error)]
pub enum PlanError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("plan has no steps")]
    Empty,

    #[error("duplicate step ID: {0}")]
    DuplicateStep(StepId),

    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: StepId, dependency: StepId },

    /// Every step that participates in a cycle, ascending.
    #[error("cycle detected involving steps {steps:?}")]
    CycleDetected { steps: Vec<StepId> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `Plan`.
pub fn parse_plan_yaml(yaml: &str) -> Result<Plan, PlanError> {
    let plan: Plan =
        serde_yaml_ng::from_str(yaml).map_err(|e| PlanError::Parse(e.to_string()))?;
    validate_plan(&plan)?;
    Ok(plan)
}

/// Parse a JSON string into a validated `Plan`.
pub fn parse_plan_json(json: &str) -> Result<Plan, PlanError> {
    let plan: Plan = serde_json::from_str(json).map_err(|e| PlanError::Parse(e.to_string()))?;
    validate_plan(&plan)?;
    Ok(plan)
}

/// Load a plan from disk. `.json` files are parsed as JSON, anything else as YAML.
pub async fn load_plan(path: &Path) -> Result<Plan, PlanError> {
    let content = tokio::fs::read_to_string(path).await?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_plan_json(&content),
        _ => parse_plan_yaml(&content),
    }
}

/// Serialize a plan to YAML.
pub fn serialize_plan_yaml(plan: &Plan) -> Result<String, PlanError> {
    serde_yaml_ng::to_string(plan).map_err(|e| PlanError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a plan.
///
/// Checks:
/// - At least one step exists
/// - All step IDs are unique
/// - All `depends_on` references point to existing step IDs
/// - The dependency relation is acyclic
pub fn validate_plan(plan: &Plan) -> Result<(), PlanError> {
    if plan.steps.is_empty() {
        return Err(PlanError::Empty);
    }
    DependencyGraph::build(&plan.steps).map(|_| ())
}
