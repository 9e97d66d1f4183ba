//! Event bus for workflow and job lifecycle notifications.
//!
//! - `bus` -- prioritised fan-out with blocking backpressure and sequence numbers
//! - `subscriber` -- filters, handler trait, per-subscriber delivery task
//! - `persistence` -- checkpoint sink hook and trigger policy

pub mod bus;
pub mod persistence;
pub mod subscriber;

pub use bus::{EventBus, EventBusError, SubscriptionId};
pub use persistence::CheckpointSink;
pub use subscriber::{ChannelHandler, EventFilter, EventHandler, FnHandler};
