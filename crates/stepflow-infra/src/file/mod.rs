//! Filesystem adapters.

pub mod checkpoint;

pub use checkpoint::FileCheckpointStore;
