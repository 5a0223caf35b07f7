//! Storage implementations.
//!
//! Available backends:
//! - `MemoryStore` / `MemorySignalSink` - in-process, for tests and local runs
//! - `PostgresStore` / `PostgresSignalSink` - shared coordination database
//! - `PgSourceRegistry` - external Postgres sources keyed by `source_ref`

pub mod memory;
pub mod postgres;
pub mod sources;

pub use memory::{MemorySignalSink, MemoryStore};
pub use postgres::{PostgresSignalSink, PostgresStore};
pub use sources::{PgSourceConnection, PgSourceRegistry};
