//! Run store implementations for the weft engine
//!
//! Two implementations of `weft_core::traits::RunStore`: a durable
//! SQLite store for deployments and an in-memory store for tests and
//! ephemeral embeddings.

pub mod memory;
mod schema;
pub mod sqlite;

pub use memory::MemoryRunStore;
pub use sqlite::SqliteRunStore;
