//! # erpgate persistence
//!
//! Storage for job records and the structures that guard the ERP against
//! duplicate work.
//!
//! Supports:
//! - In-memory (for testing)
//! - SQLite (for single-node deployments), including a durable peek-lock queue

pub mod backend;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod queue;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use backend::{CoalesceOutcome, JobStore, JobTransition, StorageError, UpdateBuffer};
pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use queue::SqliteQueue;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteConfig, SqliteStore};
