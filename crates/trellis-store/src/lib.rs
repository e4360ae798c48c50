//! Run persistence backends: a SQLite store with buffered writes and a
//! TTL read cache, and an in-process store for tests.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryRunStore;
pub use sqlite::SqliteRunStore;
