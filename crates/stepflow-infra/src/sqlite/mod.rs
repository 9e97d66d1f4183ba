//! SQLite storage layer.
//!
//! Repository implementations backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod checkpoint;
pub mod pool;

pub use checkpoint::SqliteCheckpointStore;
pub use pool::DatabasePool;
