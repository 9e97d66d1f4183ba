//! MemoryStore trait definition.
//!
//! Key/value memory workers can read and write while a plan runs. Follows
//! the same RPITIT pattern as `CheckpointStore`.

use serde_json::Value;
use stepflow_types::error::RepositoryError;

/// Capability contract for worker memory.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition).
pub trait MemoryStore: Send + Sync {
    /// Insert or replace the value under `key`.
    fn store(
        &self,
        key: &str,
        value: Value,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Value under `key`, if present. Counts as a use of the entry.
    fn retrieve(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Value>, RepositoryError>> + Send;

    /// Entries whose key or value contains `query` (case-insensitive), most
    /// recently used first, at most `limit` of them.
    fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<(String, Value)>, RepositoryError>> + Send;

    /// Remove every entry.
    fn clear(&self) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All keys, most recently used first.
    fn list(&self) -> impl std::future::Future<Output = Result<Vec<String>, RepositoryError>> + Send;
}
