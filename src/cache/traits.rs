//! Core types for the caching system.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Version stamped into every durable entry. Entries written under another
/// version are discarded on read.
pub const SCHEMA_VERSION: &str = "1";

/// A cached value with its freshness metadata.
///
/// Serialized form is `{ data, createdAt, ttl, schemaVersion }` with
/// `createdAt` in epoch milliseconds and `ttl` in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
  pub data: T,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub created_at: DateTime<Utc>,
  #[serde(rename = "ttl")]
  pub ttl_ms: i64,
  pub schema_version: String,
}

impl<T> CacheEntry<T> {
  pub fn new(data: T, created_at: DateTime<Utc>, ttl: Duration) -> Self {
    Self {
      data,
      created_at,
      ttl_ms: ttl.num_milliseconds(),
      schema_version: SCHEMA_VERSION.to_string(),
    }
  }

  /// Stored TTL. A value chrono cannot represent reads as zero, which
  /// makes the entry expired.
  pub fn ttl(&self) -> Duration {
    Duration::try_milliseconds(self.ttl_ms).unwrap_or_else(Duration::zero)
  }

  /// An entry is valid while `now - created_at < ttl`; at exactly `ttl` it is gone.
  pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
    now - self.created_at < self.ttl()
  }

  pub fn is_current_schema(&self) -> bool {
    self.schema_version == SCHEMA_VERSION
  }
}

/// Point-in-time view of the cache. Computed on demand, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
  pub memory_entry_count: usize,
  pub durable_entry_count: usize,
  pub durable_byte_size: u64,
  pub hits: u64,
  pub misses: u64,
  /// `hits / (hits + misses)`, 0.0 before the first lookup
  pub hit_rate: f64,
  /// Durable writes given up on after the quota retry
  pub durable_write_drops: u64,
  pub last_sweep_at: Option<DateTime<Utc>>,
}

/// Arguments for [`CacheEngine::invalidate`](super::CacheEngine::invalidate).
///
/// With `max_age` set, every entry older than that is purged and the key
/// components are ignored. Otherwise `kind` and `scope_ids` are joined with
/// `_` into a prefix pattern.
#[derive(Debug, Clone, Default)]
pub struct InvalidateOptions {
  pub kind: Option<String>,
  pub scope_ids: Vec<String>,
  pub max_age: Option<Duration>,
}

impl InvalidateOptions {
  pub fn scope(kind: impl Into<String>, scope_ids: &[&str]) -> Self {
    Self {
      kind: Some(kind.into()),
      scope_ids: scope_ids.iter().map(|s| s.to_string()).collect(),
      max_age: None,
    }
  }

  pub fn older_than(max_age: Duration) -> Self {
    Self {
      max_age: Some(max_age),
      ..Self::default()
    }
  }

  /// Key pattern for the scope form, e.g. `rce_20612969125_202408*`.
  pub fn pattern(&self) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(kind) = self.kind.as_deref() {
      parts.push(kind);
    }
    parts.extend(self.scope_ids.iter().map(String::as_str));

    if parts.is_empty() {
      "*".to_string()
    } else {
      format!("{}*", parts.join("_"))
    }
  }
}

/// Indicates where synced data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheSource {
  /// Fresh data from the remote source
  Network,
  /// Served from the cache without a remote call
  Cache,
}
