//! Collaborator seams.
//!
//! The scheduler and executor only talk to these traits:
//! - `store`: coordination datastore (jobs, leases, execution history)
//! - `sink`: downstream signal ingestion
//! - `source`: external databases queried by jobs

pub mod sink;
pub mod source;
pub mod store;

pub use sink::SignalSink;
pub use source::{SourceConnection, SourceResolver};
pub use store::{ExecutionLog, JobStore, LeaseStore, LoaderStore};
