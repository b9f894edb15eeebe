//! `SQLite` persistence adapters for sublingo.
//!
//! Implements the core's `JobStorePort` and `SourceCacheIndexPort` on top
//! of a shared `sqlx` pool. Schema creation is idempotent; see [`setup`].

mod repositories;
pub mod setup;

pub use repositories::{SqliteJobRepository, SqliteSourceCacheRepository};
pub use setup::setup_database;

#[cfg(any(test, feature = "test-utils"))]
pub use setup::setup_test_database;

// Silence unused dev-dependency warnings
#[cfg(test)]
use tokio_test as _;
