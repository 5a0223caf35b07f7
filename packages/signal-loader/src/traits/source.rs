//! External source databases.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::SourceRow;

/// A connection to an external database. The query text is opaque here;
/// dialect is the job author's concern.
#[async_trait]
pub trait SourceConnection: Send + Sync {
    async fn query(&self, sql: &str) -> Result<Vec<SourceRow>>;
}

/// Resolves a job's `source_ref` to a connection. Credentials live outside
/// the loader.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn connect(&self, source_ref: &str) -> Result<Arc<dyn SourceConnection>>;
}
