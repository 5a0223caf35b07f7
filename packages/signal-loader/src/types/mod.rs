//! Data model shared by the scheduler, the lock manager and the stores.

pub mod execution;
pub mod job;
pub mod lease;
pub mod signal;
pub mod window;

pub use execution::{
    merge_metadata, EmptyReason, ExecutionFinish, ExecutionOutcome, ExecutionRecord, NewExecution,
};
pub use job::{Job, JobDefinition, JobStatus, PurgeStrategy};
pub use lease::Lease;
pub use signal::{ColumnValue, SignalKey, SignalRecord, SourceRow};
pub use window::TimeWindow;
