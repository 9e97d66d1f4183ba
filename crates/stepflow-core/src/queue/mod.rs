//! Priority job queue and the step runner that routes work through it.

pub mod job_queue;
pub mod queued_runner;

pub use job_queue::{JobContext, JobQueue, JobSpec, QueueError, QueueStats};
pub use queued_runner::QueuedRunner;
