// Common test utilities

pub mod harness;

pub use harness::*;

use uuid::Uuid;

/// Job code unique to one test, so tests can share a database.
pub fn unique_code(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}
