//! Workflow engine core: plan loading, DAG scheduling, and durable checkpointing.
//!
//! - `plan` -- YAML/JSON plan parsing, validation, filesystem load
//! - `dag` -- dependency graph, cycle detection, ready/skippable queries
//! - `state` -- per-run step state with guarded transitions
//! - `retry` -- error classification and exponential backoff
//! - `runner` -- the `StepRunner` seam and worker dispatch
//! - `checkpoint` -- durable checkpoint manager for crash recovery
//! - `executor` -- bounded-concurrency parallel executor

pub mod checkpoint;
pub mod dag;
pub mod executor;
pub mod plan;
pub mod retry;
pub mod runner;
pub mod state;
