//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (stepflow-infra) implements. The core crate never depends on any
//! specific storage technology; the in-memory implementations here back
//! tests and short-lived runs.

pub mod checkpoint;

pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore};
