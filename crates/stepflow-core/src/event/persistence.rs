//! Checkpoint persistence hook for the event bus.
//!
//! The bus calls an attached `CheckpointSink` for every event that the
//! configured `CheckpointPolicy` selects, and waits for the write to finish
//! before any subscriber sees the event.

use std::future::Future;
use std::pin::Pin;

use stepflow_types::config::CheckpointPolicy;
use stepflow_types::event::EventKind;
use stepflow_types::workflow::WorkflowCheckpoint;

use crate::workflow::checkpoint::CheckpointError;

/// Destination for checkpoints produced by the bus.
///
/// Object-safe (boxed future) so the bus can hold any store behind one `Arc`.
pub trait CheckpointSink: Send + Sync {
    fn write_checkpoint<'a>(
        &'a self,
        checkpoint: WorkflowCheckpoint,
    ) -> Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + 'a>>;
}

/// Whether an event of `kind` triggers a checkpoint under `policy`.
pub fn should_checkpoint(policy: CheckpointPolicy, kind: EventKind) -> bool {
    match policy {
        CheckpointPolicy::TerminalTransitions => kind.is_terminal_transition(),
        CheckpointPolicy::EveryTransition => kind.is_state_transition(),
    }
}
