//! Two-tier cache for data fetched from SUNAT.
//!
//! This module provides a generic caching mechanism that:
//! - Keeps a bounded volatile tier in process memory
//! - Persists entries to a size-bounded durable key/value store
//! - Expires entries by per-entry TTL, lazily and in periodic sweeps
//! - Supports glob-pattern and age-based invalidation
//! - Never surfaces storage failures to callers

mod layer;
mod storage;
mod traits;

pub use layer::{CacheEngine, KEY_PREFIX};
pub use storage::{DurableStore, MemoryStorage, NoopStorage, SqliteStorage, StorageError, StorageResult};
pub use traits::{CacheEntry, CacheSource, CacheStats, InvalidateOptions, SCHEMA_VERSION};
