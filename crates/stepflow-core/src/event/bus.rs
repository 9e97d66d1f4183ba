//! Prioritised publish/subscribe event bus with checkpoint persistence.
//!
//! Every subscriber gets its own bounded inbound channel and a delivery task
//! (see [`super::subscriber`]). `publish` assigns the next sequence number,
//! writes a checkpoint when the event and policy call for one, then fans the
//! event out to matching subscribers. When a subscriber's channel is full,
//! `publish` waits for space: events are never dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use stepflow_types::config::{CheckpointPolicy, EventBusConfig};
use stepflow_types::event::Event;
use stepflow_types::workflow::{RunSnapshot, WorkflowCheckpoint};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

use super::persistence::{CheckpointSink, should_checkpoint};
use super::subscriber::{ChannelHandler, EventFilter, EventHandler, deliver};
use crate::workflow::checkpoint::CheckpointError;

pub type SubscriptionId = u64;

#[derive(Debug, Error)]
pub enum EventBusError {
    /// The event was delivered but its checkpoint could not be written.
    #[error("checkpoint for event {seq} failed: {source}")]
    Persistence {
        seq: u64,
        #[source]
        source: CheckpointError,
    },
}

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
}

struct Inner {
    next_seq: AtomicU64,
    next_subscription: AtomicU64,
    subscribers: DashMap<SubscriptionId, Subscriber>,
    /// Serialises sequence assignment, persistence and fan-out so every
    /// subscriber sees events in sequence order.
    publish_lock: Mutex<()>,
    buffer: usize,
    policy: CheckpointPolicy,
    sink: Option<Arc<dyn CheckpointSink>>,
}

/// Multi-producer event bus. Cloning shares the same subscribers and sequence.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(config: &EventBusConfig) -> Self {
        Self::build(config, None)
    }

    /// Bus that writes checkpoints to `sink` per `config.checkpoint_policy`.
    pub fn with_persistence(config: &EventBusConfig, sink: Arc<dyn CheckpointSink>) -> Self {
        Self::build(config, Some(sink))
    }

    fn build(config: &EventBusConfig, sink: Option<Arc<dyn CheckpointSink>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                next_seq: AtomicU64::new(1),
                next_subscription: AtomicU64::new(1),
                subscribers: DashMap::new(),
                publish_lock: Mutex::new(()),
                buffer: config.subscriber_buffer.max(1),
                policy: config.checkpoint_policy,
                sink,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Register `handler` for events matching `filter`.
    ///
    /// Must be called from within a Tokio runtime; spawns the delivery task.
    pub fn subscribe<H: EventHandler>(&self, filter: EventFilter, handler: H) -> SubscriptionId {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        self.inner.subscribers.insert(id, Subscriber { filter, tx });
        tokio::spawn(deliver(rx, handler, self.inner.buffer, id));
        tracing::debug!(subscription = id, "subscriber registered");
        id
    }

    /// Subscribe and receive matching events on a channel of `capacity`.
    ///
    /// Dropping the receiver ends the subscription.
    pub fn subscribe_channel(&self, filter: EventFilter, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribe(filter, ChannelHandler::new(tx));
        rx
    }

    /// Remove a subscription. Events already buffered for it are still handled.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.subscribers.remove(&id).is_some();
        if removed {
            tracing::debug!(subscription = id, "subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Publish an event that carries no workflow state. Returns its sequence number.
    pub async fn publish(&self, event: Event) -> u64 {
        let _guard = self.inner.publish_lock.lock().await;
        let event = self.stamp(event);
        let seq = event.seq;
        self.fan_out(event).await;
        seq
    }

    /// Publish a workflow event, checkpointing `snapshot` first when the
    /// policy selects this event kind.
    ///
    /// Subscribers are notified even when the checkpoint write fails; the
    /// failure is returned so the caller can record it.
    pub async fn publish_with_snapshot(
        &self,
        event: Event,
        snapshot: &RunSnapshot,
    ) -> Result<u64, EventBusError> {
        let _guard = self.inner.publish_lock.lock().await;
        let event = self.stamp(event);
        let seq = event.seq;

        let mut persisted = Ok(());
        if let Some(sink) = &self.inner.sink {
            if should_checkpoint(self.inner.policy, event.kind) {
                let checkpoint = WorkflowCheckpoint::from_snapshot(snapshot, seq);
                if let Err(e) = sink.write_checkpoint(checkpoint).await {
                    tracing::error!(
                        run_id = %snapshot.run_id,
                        seq,
                        error = %e,
                        "checkpoint write failed"
                    );
                    persisted = Err(EventBusError::Persistence { seq, source: e });
                }
            }
        }

        self.fan_out(event).await;
        persisted.map(|()| seq)
    }

    /// Make sure the next sequence number is greater than `seq`.
    ///
    /// Used on resume so new checkpoints supersede the one resumed from.
    pub fn resume_sequence_from(&self, seq: u64) {
        self.inner.next_seq.fetch_max(seq + 1, Ordering::SeqCst);
    }

    /// Sequence number the next published event will get.
    pub fn next_sequence(&self) -> u64 {
        self.inner.next_seq.load(Ordering::SeqCst)
    }

    fn stamp(&self, mut event: Event) -> Event {
        event.seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        event
    }

    async fn fan_out(&self, event: Event) {
        // Collect first: no map guard may be held across an await.
        let targets: Vec<(SubscriptionId, mpsc::Sender<Event>)> = self
            .inner
            .subscribers
            .iter()
            .filter(|s| s.filter.matches(&event))
            .map(|s| (*s.key(), s.tx.clone()))
            .collect();

        for (id, tx) in targets {
            if tx.send(event.clone()).await.is_err() {
                // Delivery task has exited (handler stopped).
                self.inner.subscribers.remove(&id);
                tracing::debug!(subscription = id, "dropped closed subscriber");
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.inner.subscribers.len())
            .field("next_seq", &self.next_sequence())
            .field("policy", &self.inner.policy)
            .field("persistent", &self.inner.sink.is_some())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&EventBusConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    use stepflow_types::event::{EventKind, EventPayload, EventPriority};
    use stepflow_types::workflow::RunStatus;
    use tokio::sync::Notify;
    use uuid::Uuid;

    use crate::event::subscriber::FnHandler;

    fn skipped(step_id: u32) -> Event {
        Event::new(
            Uuid::nil(),
            EventPayload::StepSkipped {
                step_id,
                reason: "test".into(),
            },
        )
    }

    fn started(step_id: u32) -> Event {
        Event::new(
            Uuid::nil(),
            EventPayload::StepStarted {
                step_id,
                attempt: 1,
                worker: stepflow_types::workflow::WorkerKind::Coder,
            },
        )
    }

    fn snapshot() -> RunSnapshot {
        RunSnapshot {
            run_id: Uuid::now_v7(),
            plan_id: Uuid::now_v7(),
            status: RunStatus::Running,
            steps: BTreeMap::new(),
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_sequence_numbers_increase() {
        let bus = EventBus::default();
        let a = bus.publish(skipped(1)).await;
        let b = bus.publish(skipped(2)).await;
        assert_eq!((a, b), (1, 2));
        bus.resume_sequence_from(10);
        assert_eq!(bus.publish(skipped(3)).await, 11);
        bus.resume_sequence_from(3);
        assert_eq!(bus.next_sequence(), 12, "never moves backwards");
    }

    #[tokio::test]
    async fn test_each_subscriber_gets_each_matching_event_once() {
        let bus = EventBus::default();
        let mut all = bus.subscribe_channel(EventFilter::all(), 16);
        let mut only_started = bus.subscribe_channel(EventFilter::kinds([EventKind::StepStarted]), 16);

        bus.publish(started(1)).await;
        bus.publish(skipped(2)).await;
        bus.publish(started(3)).await;

        let seqs: Vec<u64> = vec![
            recv(&mut all).await.seq,
            recv(&mut all).await.seq,
            recv(&mut all).await.seq,
        ];
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(recv(&mut only_started).await.payload.step_id(), Some(1));
        assert_eq!(recv(&mut only_started).await.payload.step_id(), Some(3));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(all.try_recv().is_err(), "no duplicates");
        assert!(only_started.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_priority_then_publish_order() {
        let bus = EventBus::default();
        let gate = Arc::new(Notify::new());
        let (tx, mut rx) = mpsc::channel(16);

        let handler_gate = gate.clone();
        bus.subscribe(
            EventFilter::all(),
            FnHandler(move |event: Event| {
                let gate = handler_gate.clone();
                let tx = tx.clone();
                async move {
                    // Hold the first event until the rest are queued.
                    if event.seq == 1 {
                        gate.notified().await;
                    }
                    let _ = tx.send((event.seq, event.priority)).await;
                }
            }),
        );

        bus.publish(skipped(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(skipped(2).with_priority(EventPriority::Low)).await;
        bus.publish(skipped(3).with_priority(EventPriority::Normal)).await;
        bus.publish(skipped(4).with_priority(EventPriority::Critical)).await;
        bus.publish(skipped(5).with_priority(EventPriority::Low)).await;
        bus.publish(skipped(6).with_priority(EventPriority::Critical)).await;
        gate.notify_one();

        let mut order = Vec::new();
        for _ in 0..6 {
            let (seq, _) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            order.push(seq);
        }
        assert_eq!(order, vec![1, 4, 6, 3, 2, 5]);
    }

    #[tokio::test]
    async fn test_backpressure_blocks_publisher_without_dropping() {
        let config = EventBusConfig {
            subscriber_buffer: 1,
            ..EventBusConfig::default()
        };
        let bus = EventBus::new(&config);
        let mut rx = bus.subscribe_channel(EventFilter::all(), 1);

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                for step in 0..10 {
                    bus.publish(skipped(step)).await;
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publisher.is_finished(), "publisher must wait for a slow subscriber");

        let mut seqs = Vec::new();
        for _ in 0..10 {
            seqs.push(recv(&mut rx).await.seq);
        }
        assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_and_dropped_receiver() {
        let bus = EventBus::default();
        let id = bus.subscribe(EventFilter::all(), FnHandler(|_e: Event| async {}));
        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        let rx = bus.subscribe_channel(EventFilter::all(), 1);
        drop(rx);
        // First publish wakes the handler, which notices the closed receiver.
        bus.publish(skipped(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(skipped(2)).await;
        assert_eq!(bus.subscriber_count(), 0);
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    struct RecordingSink {
        written: std::sync::Mutex<Vec<u64>>,
        fail: bool,
    }

    impl CheckpointSink for RecordingSink {
        fn write_checkpoint<'a>(
            &'a self,
            checkpoint: WorkflowCheckpoint,
        ) -> Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + 'a>> {
            Box::pin(async move {
                if self.fail {
                    return Err(CheckpointError::Repository("disk full".into()));
                }
                self.written.lock().unwrap().push(checkpoint.last_event_seq);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_checkpoint_written_before_delivery() {
        let sink = Arc::new(RecordingSink {
            written: std::sync::Mutex::new(Vec::new()),
            fail: false,
        });
        let bus = EventBus::with_persistence(&EventBusConfig::default(), sink.clone());

        let observed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::channel(4);
        {
            let sink = sink.clone();
            let observed = observed.clone();
            bus.subscribe(
                EventFilter::all(),
                FnHandler(move |event: Event| {
                    let persisted = sink.written.lock().unwrap().contains(&event.seq);
                    observed.lock().unwrap().push((event.seq, persisted));
                    let done_tx = done_tx.clone();
                    async move {
                        let _ = done_tx.send(()).await;
                    }
                }),
            );
        }

        let snap = snapshot();
        assert_eq!(bus.publish_with_snapshot(started(1), &snap).await.unwrap(), 1);
        assert_eq!(bus.publish_with_snapshot(skipped(1), &snap).await.unwrap(), 2);
        for _ in 0..2 {
            done_rx.recv().await.unwrap();
        }

        assert_eq!(*sink.written.lock().unwrap(), vec![2], "only the terminal transition");
        assert_eq!(*observed.lock().unwrap(), vec![(1, false), (2, true)]);
    }

    #[tokio::test]
    async fn test_failed_checkpoint_still_delivers() {
        let sink = Arc::new(RecordingSink {
            written: std::sync::Mutex::new(Vec::new()),
            fail: true,
        });
        let bus = EventBus::with_persistence(&EventBusConfig::default(), sink);
        let mut rx = bus.subscribe_channel(EventFilter::all(), 4);

        let err = bus
            .publish_with_snapshot(skipped(1), &snapshot())
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::Persistence { seq: 1, .. }));
        assert_eq!(recv(&mut rx).await.seq, 1);
    }
}
