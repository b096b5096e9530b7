/// Persistence Layer
///
/// Durable event log and running-instance registry behind the
/// `InstanceStore` trait, with SQLite, Postgres and in-memory backends.

// Store contract and record types
pub mod store;

// sqlx SQLite backend
pub mod sqlite;

// sqlx Postgres backend
pub mod postgres;

// tokio RwLock backend for tests and ephemeral runs
pub mod memory;

pub use memory::MemoryInstanceStore;
pub use postgres::PostgresInstanceStore;
pub use sqlite::SqliteInstanceStore;
pub use store::{EventRecord, InstanceStore, RunningInstanceLog};
