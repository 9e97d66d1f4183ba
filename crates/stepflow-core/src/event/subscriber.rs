//! Subscriber side of the event bus: filters, handlers, and the per-subscriber
//! delivery task.
//!
//! Each subscriber owns a bounded inbound channel fed by `publish` and a
//! delivery task that moves events into a bounded local priority buffer and
//! hands them to the handler one at a time, highest priority first and in
//! publish order within a priority.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::future::Future;
use std::ops::ControlFlow;

use stepflow_types::event::{Event, EventKind, EventPriority};
use tokio::sync::mpsc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// EventFilter
// ---------------------------------------------------------------------------

/// Selects which events a subscriber receives.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    kinds: Option<HashSet<EventKind>>,
    correlation_id: Option<Uuid>,
}

impl EventFilter {
    /// Every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only events of the given kinds.
    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
            correlation_id: None,
        }
    }

    /// Additionally restrict to one run or job.
    pub fn for_correlation(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.kinds.as_ref().is_none_or(|k| k.contains(&event.kind))
            && self.correlation_id.is_none_or(|id| id == event.correlation_id)
    }
}

// ---------------------------------------------------------------------------
// EventHandler
// ---------------------------------------------------------------------------

/// Receives events for one subscription.
///
/// Returning `ControlFlow::Break` ends the subscription.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: Event) -> impl Future<Output = ControlFlow<()>> + Send;
}

/// Adapts an async closure into an `EventHandler` that never unsubscribes.
pub struct FnHandler<F>(pub F);

impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, event: Event) -> ControlFlow<()> {
        (self.0)(event).await;
        ControlFlow::Continue(())
    }
}

/// Forwards events into an `mpsc` channel. Stops once the receiver is dropped.
pub struct ChannelHandler {
    tx: mpsc::Sender<Event>,
}

impl ChannelHandler {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }
}

impl EventHandler for ChannelHandler {
    async fn handle(&self, event: Event) -> ControlFlow<()> {
        match self.tx.send(event).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Heap entry: higher priority first, then lower sequence number first.
struct Pending(Event);

impl Pending {
    fn key(&self) -> (EventPriority, Reverse<u64>) {
        (self.0.priority, Reverse(self.0.seq))
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Drive one subscriber until its inbound channel closes (or the handler
/// asks to stop) and every buffered event has been handled.
pub(crate) async fn deliver<H: EventHandler>(
    mut rx: mpsc::Receiver<Event>,
    handler: H,
    buffer: usize,
    subscription: u64,
) {
    let mut heap: BinaryHeap<Pending> = BinaryHeap::with_capacity(buffer);
    loop {
        if heap.is_empty() {
            match rx.recv().await {
                Some(event) => heap.push(Pending(event)),
                None => break,
            }
        }
        while heap.len() < buffer {
            match rx.try_recv() {
                Ok(event) => heap.push(Pending(event)),
                Err(_) => break,
            }
        }

        let Some(Pending(event)) = heap.pop() else {
            continue;
        };
        if handler.handle(event).await.is_break() {
            tracing::debug!(subscription, "subscriber handler stopped");
            break;
        }
    }
}
