//! Persistent, named cache partitions.
//!
//! This module provides the partition registry shared by every worker
//! instance:
//! - Partitions are named `<role>-v<version>` and created on demand
//! - Entries map a normalized request key to a captured response
//! - Writes overwrite whole entries, so concurrent instances never tear one
//! - Storage is SQLite and survives process restarts

mod registry;
mod storage;
mod traits;

pub use registry::CacheRegistry;
pub use storage::{PartitionStore, SqliteStorage};
pub use traits::{CacheSource, CachedEntry, Served};
