//! Worker invocation contract: output and typed failure.
//!
//! Workers are opaque to the engine. They return a free-form `WorkerOutput`
//! or a `WorkerError` whose variant tells the retry manager whether the
//! failure is worth retrying.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Token and cost usage reported by a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

impl TokenUsage {
    pub fn combine(self, other: &TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            cost_usd: self.cost_usd + other.cost_usd,
        }
    }
}

/// Successful result of a worker invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    /// Free-form output (summary, diff, report...).
    pub output: String,
    /// Optional structured data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl WorkerOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            data: None,
            usage: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Typed worker failure.
///
/// The variant carries enough information for retry classification:
/// `Network`, `RateLimited` and `Timeout` are transient, `Failed` and
/// `Cancelled` are permanent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("worker failed: {message}")]
    Failed { message: String },

    #[error("cancelled: {reason}")]
    Cancelled { reason: String },
}

impl WorkerError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn timeout(elapsed: Duration) -> Self {
        Self::Timeout {
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
        }
    }
}
