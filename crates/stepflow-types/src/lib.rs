//! Shared domain types for Stepflow.
//!
//! Plain data used across the engine: plans and steps, worker results,
//! jobs, lifecycle events, checkpoints and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod job;
pub mod worker;
pub mod workflow;
