//! Lifecycle event types for the Stepflow event bus.
//!
//! `Event` is the unified envelope distributed to subscribers. The closed
//! `EventPayload` enum carries kind-specific data; `EventKind` is the tag
//! subscribers filter on. Events are immutable once published.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{JobId, JobPriority, JobStatus};
use crate::workflow::{StepId, WorkerKind};

/// Delivery priority. Higher variants are delivered first when several
/// events are pending for the same subscriber. Never used for dropping.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Closed set of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    StepStarted,
    StepRetrying,
    StepCompleted,
    StepFailed,
    StepSkipped,
    RunCompleted,
    RunFailed,
    RunCancelled,
    JobEnqueued,
    JobStarted,
    JobFinished,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::RunStarted,
        EventKind::StepStarted,
        EventKind::StepRetrying,
        EventKind::StepCompleted,
        EventKind::StepFailed,
        EventKind::StepSkipped,
        EventKind::RunCompleted,
        EventKind::RunFailed,
        EventKind::RunCancelled,
        EventKind::JobEnqueued,
        EventKind::JobStarted,
        EventKind::JobFinished,
    ];

    pub fn default_priority(self) -> EventPriority {
        match self {
            EventKind::RunFailed | EventKind::RunCancelled => EventPriority::Critical,
            EventKind::StepFailed | EventKind::RunCompleted => EventPriority::High,
            EventKind::JobEnqueued | EventKind::JobStarted => EventPriority::Low,
            _ => EventPriority::Normal,
        }
    }

    /// Step or run reached a terminal status.
    pub fn is_terminal_transition(self) -> bool {
        matches!(
            self,
            EventKind::StepCompleted
                | EventKind::StepFailed
                | EventKind::StepSkipped
                | EventKind::RunCompleted
                | EventKind::RunFailed
                | EventKind::RunCancelled
        )
    }

    /// Any step or run state transition (terminal or not).
    pub fn is_state_transition(self) -> bool {
        self.is_terminal_transition()
            || matches!(
                self,
                EventKind::RunStarted | EventKind::StepStarted | EventKind::StepRetrying
            )
    }
}

/// Kind-specific event data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    RunStarted {
        plan_id: Uuid,
        goal: String,
        total_steps: usize,
        resumed: bool,
    },
    StepStarted {
        step_id: StepId,
        attempt: u32,
        worker: WorkerKind,
    },
    StepRetrying {
        step_id: StepId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StepCompleted {
        step_id: StepId,
        attempt: u32,
        duration_ms: u64,
    },
    StepFailed {
        step_id: StepId,
        attempt: u32,
        error: String,
    },
    StepSkipped {
        step_id: StepId,
        reason: String,
    },
    RunCompleted {
        duration_ms: u64,
        steps_completed: usize,
    },
    RunFailed {
        duration_ms: u64,
        failed_steps: Vec<StepId>,
        skipped_steps: Vec<StepId>,
    },
    RunCancelled {
        reason: String,
        completed_steps: Vec<StepId>,
    },
    JobEnqueued {
        job_id: JobId,
        priority: JobPriority,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    JobStarted {
        job_id: JobId,
        attempt: u32,
    },
    JobFinished {
        job_id: JobId,
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::RunStarted { .. } => EventKind::RunStarted,
            EventPayload::StepStarted { .. } => EventKind::StepStarted,
            EventPayload::StepRetrying { .. } => EventKind::StepRetrying,
            EventPayload::StepCompleted { .. } => EventKind::StepCompleted,
            EventPayload::StepFailed { .. } => EventKind::StepFailed,
            EventPayload::StepSkipped { .. } => EventKind::StepSkipped,
            EventPayload::RunCompleted { .. } => EventKind::RunCompleted,
            EventPayload::RunFailed { .. } => EventKind::RunFailed,
            EventPayload::RunCancelled { .. } => EventKind::RunCancelled,
            EventPayload::JobEnqueued { .. } => EventKind::JobEnqueued,
            EventPayload::JobStarted { .. } => EventKind::JobStarted,
            EventPayload::JobFinished { .. } => EventKind::JobFinished,
        }
    }

    /// The step this event refers to, if any.
    pub fn step_id(&self) -> Option<StepId> {
        match self {
            EventPayload::StepStarted { step_id, .. }
            | EventPayload::StepRetrying { step_id, .. }
            | EventPayload::StepCompleted { step_id, .. }
            | EventPayload::StepFailed { step_id, .. }
            | EventPayload::StepSkipped { step_id, .. } => Some(*step_id),
            _ => None,
        }
    }
}

/// A published lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Assigned by the bus at publish time; strictly increasing.
    pub seq: u64,
    pub kind: EventKind,
    pub priority: EventPriority,
    /// Run ID for workflow events, job ID for queue events.
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    /// Build an unpublished event with the kind's default priority.
    pub fn new(correlation_id: Uuid, payload: EventPayload) -> Self {
        let kind = payload.kind();
        Self {
            seq: 0,
            kind,
            priority: kind.default_priority(),
            correlation_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_derived_from_payload() {
        let event = Event::new(
            Uuid::nil(),
            EventPayload::StepFailed {
                step_id: 2,
                attempt: 1,
                error: "boom".into(),
            },
        );
        assert_eq!(event.kind, EventKind::StepFailed);
        assert_eq!(event.priority, EventPriority::High);
        assert_eq!(event.payload.step_id(), Some(2));
        assert_eq!(event.seq, 0);
    }

    #[test]
    fn terminal_transition_classification() {
        assert!(EventKind::StepSkipped.is_terminal_transition());
        assert!(EventKind::RunCancelled.is_terminal_transition());
        assert!(!EventKind::StepStarted.is_terminal_transition());
        assert!(EventKind::StepStarted.is_state_transition());
        assert!(!EventKind::JobFinished.is_state_transition());
    }

    #[test]
    fn every_kind_listed_once() {
        let unique: std::collections::HashSet<_> = EventKind::ALL.iter().collect();
        assert_eq!(unique.len(), EventKind::ALL.len());
    }

    #[test]
    fn payload_serializes_with_type_tag() {
        let payload = EventPayload::StepSkipped {
            step_id: 4,
            reason: "dependency 2 failed".into(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "step_skipped");
        assert_eq!(value["step_id"], 4);
    }
}
