//! Execution engine and storage ports for Stepflow.
//!
//! This crate holds the scheduling logic (dependency graph, execution state,
//! parallel executor, retry policy), the priority job queue, the event bus
//! and the "ports" (storage traits) that the infrastructure layer
//! implements. It depends only on `stepflow-types` -- never on
//! `stepflow-infra` or any database crate.

pub mod event;
pub mod memory;
pub mod queue;
pub mod repository;
pub mod workflow;
