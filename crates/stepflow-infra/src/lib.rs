//! Infrastructure layer for Stepflow.
//!
//! Contains implementations of the storage ports defined in `stepflow-core`
//! (JSON-file and SQLite checkpoint stores) and the `config.toml` loader.

pub mod config;
pub mod file;
pub mod sqlite;
pub mod storage;
