//! Memory shared by workers across the steps of a run.
//!
//! - `store` -- the `MemoryStore` capability trait
//! - `short_term` -- bounded in-process LRU implementation

pub mod short_term;
pub mod store;

pub use short_term::{MemoryStats, ShortTermMemory};
pub use store::MemoryStore;
