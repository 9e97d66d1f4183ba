//! Engine configuration types for Stepflow.
//!
//! `EngineConfig` represents the top-level `config.toml` that tunes the
//! executor, retry policy, job queue, event bus and checkpoint storage.
//! Every field has a default so an empty file is a valid configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub events: EventBusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl EngineConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.executor.validate()?;
        self.retry.validate()?;
        self.queue.validate()?;
        self.events.validate()
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum number of steps running at once within a run.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// How long in-flight steps get to finish after cancellation.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// Per-attempt timeout. `None` means steps may run indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_ms: Option<u64>,
}

fn default_concurrency_limit() -> usize {
    4
}

fn default_cancel_grace_ms() -> u64 {
    5_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            cancel_grace_ms: default_cancel_grace_ms(),
            step_timeout_ms: None,
        }
    }
}

impl ExecutorConfig {
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit == 0 {
            return Err(ConfigError::Invalid(
                "executor.concurrency_limit must be greater than 0".into(),
            ));
        }
        if self.step_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "executor.step_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Exponential backoff policy applied to transient step failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound of the random extra delay, as a fraction of the computed delay.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_ratio() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter_ratio must be within [0, 1], got {}",
                self.jitter_ratio
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of worker tasks pulling jobs; the running-job ceiling.
    #[serde(default = "default_queue_workers")]
    pub workers: usize,
    /// Return a timed-out job to the queue once before failing it.
    #[serde(default = "default_requeue_on_timeout")]
    pub requeue_on_timeout: bool,
    /// Timeout applied to jobs enqueued without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
}

fn default_queue_workers() -> usize {
    4
}

fn default_requeue_on_timeout() -> bool {
    true
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_queue_workers(),
            requeue_on_timeout: default_requeue_on_timeout(),
            default_timeout_ms: None,
        }
    }
}

impl QueueConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid(
                "queue.workers must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Which events trigger a checkpoint write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// Step completed/failed/skipped and run completed/failed/cancelled.
    #[default]
    TerminalTransitions,
    /// Every step or run state transition, including starts and retries.
    EveryTransition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Capacity of each subscriber's inbound channel.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    #[serde(default)]
    pub checkpoint_policy: CheckpointPolicy,
}

fn default_subscriber_buffer() -> usize {
    256
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
            checkpoint_policy: CheckpointPolicy::default(),
        }
    }
}

impl EventBusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscriber_buffer == 0 {
            return Err(ConfigError::Invalid(
                "events.subscriber_buffer must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Checkpoint storage backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Checkpoints kept in process memory only.
    #[default]
    Memory,
    /// One JSON file per run under `dir`.
    File { dir: PathBuf },
    /// SQLite database at `url` (e.g. `sqlite://stepflow.db`).
    Sqlite { url: String },
}
