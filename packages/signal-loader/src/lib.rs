//! Distributed Incremental Signal Loader
//!
//! Periodically pulls time-windowed data from external databases, one job per
//! extraction query, and appends the rows as signal records to a central
//! store. Any number of worker replicas can run the same scheduler; the
//! coordination datastore is the only thing they share.
//!
//! # Guarantees
//!
//! - A job never runs more than `max_parallel_executions` times at once,
//!   across all replicas (lease ceiling enforced atomically by the store)
//! - A job's watermark only moves forward, and only after a successful run
//! - Every run attempt leaves an execution record
//! - A failing job never blocks other jobs in the same tick
//!
//! # Usage
//!
//! ```rust,ignore
//! use signal_loader::{HolderIdentity, MemorySignalSink, MemoryStore, Scheduler, SharedSettings};
//! use signal_loader::testing::MockSourceResolver;
//!
//! let scheduler = Scheduler::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemorySignalSink::new()),
//!     Arc::new(MockSourceResolver::new()),
//!     Arc::new(SharedSettings::default()),
//!     HolderIdentity::new("replica-a"),
//! );
//!
//! // One pass
//! let report = scheduler.tick().await?;
//!
//! // Or loop until shutdown
//! scheduler.run(shutdown_token).await;
//! ```
//!
//! # Modules
//!
//! - [`traits`] - Collaborator seams (coordination store, signal sink, sources)
//! - [`types`] - Jobs, leases, execution records, windows and signals
//! - [`scheduler`] - Polling loop and admin operations
//! - [`executor`] - One run of one job under a lease
//! - [`locks`] - Lease acquisition, release and stale-lease reaping
//! - [`substitution`] - `:fromTime` / `:toTime` literal rendering
//! - [`transform`] - Source rows to signal records
//! - [`stores`] - Memory and Postgres implementations
//! - [`config`] - Worker and scheduler settings
//! - [`testing`] - Mock implementations for testing

pub mod config;
pub mod error;
pub mod executor;
pub mod locks;
pub mod scheduler;
pub mod stores;
pub mod substitution;
pub mod testing;
pub mod traits;
pub mod transform;
pub mod types;

// Re-export core types at crate root
pub use config::{HolderIdentity, SchedulerSettings, SettingsProvider, SharedSettings, WorkerConfig};
pub use error::{LoaderError, Result};
pub use traits::{
    ExecutionLog, JobStore, LeaseStore, LoaderStore, SignalSink, SourceConnection, SourceResolver,
};
pub use types::{
    ColumnValue, EmptyReason, ExecutionFinish, ExecutionOutcome, ExecutionRecord, Job,
    JobDefinition, JobStatus, Lease, NewExecution, PurgeStrategy, SignalKey, SignalRecord,
    SourceRow, TimeWindow,
};

pub use executor::{LoadExecutor, RunOutcome};
pub use locks::LockManager;
pub use scheduler::{JobView, Scheduler, SchedulerSnapshot, TickReport};
pub use substitution::{substitute, LiteralFormat, Substitution};
pub use transform::ResultTransformer;

// Re-export stores
pub use stores::{MemorySignalSink, MemoryStore, PgSourceConnection, PgSourceRegistry, PostgresSignalSink, PostgresStore};
