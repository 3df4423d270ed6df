//! Durable persistence: SQLite store and the asynchronous write-through
//! sink.

pub mod sink;
pub mod store;

pub use sink::{PersistJob, PersistenceHandle, PersistenceSink};
pub use store::{EdgeRow, NodeRow, SqliteStore};
