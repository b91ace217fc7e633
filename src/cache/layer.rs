//! Two-tier cache engine: a bounded in-process map in front of a durable store.
//!
//! The engine is a pure optimization layer. None of its operations fail:
//! storage errors, quota pressure and corrupt payloads all degrade to a miss
//! on read or a dropped durable write.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::storage::{DurableStore, StorageError, StorageResult};
use super::traits::{CacheEntry, CacheStats, InvalidateOptions};
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;

/// Namespace for every key the engine writes to the durable store.
pub const KEY_PREFIX: &str = "sunat_cache:";

type MemoryTier = HashMap<String, CacheEntry<Value>>;

/// Result of reading one durable key.
enum DurableRead {
  Entry(CacheEntry<Value>),
  /// Absent, or unreadable because the backend failed
  Missing,
  /// Corrupt or foreign-schema entry, now removed
  Discarded,
}

/// Cache engine spanning a volatile and a durable tier.
pub struct CacheEngine<S: DurableStore> {
  storage: Arc<S>,
  clock: Arc<dyn Clock>,
  config: CacheConfig,
  memory: Mutex<MemoryTier>,
  hits: AtomicU64,
  misses: AtomicU64,
  durable_write_drops: AtomicU64,
  last_sweep_at: Mutex<Option<DateTime<Utc>>>,
}

impl<S: DurableStore> CacheEngine<S> {
  /// Create a new engine over the given durable backend.
  pub fn new(storage: S, config: CacheConfig) -> Self {
    Self {
      storage: Arc::new(storage),
      clock: Arc::new(SystemClock),
      config,
      memory: Mutex::new(HashMap::new()),
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
      durable_write_drops: AtomicU64::new(0),
      last_sweep_at: Mutex::new(None),
    }
  }

  /// Replace the time source.
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  /// Look up `key`, volatile tier first.
  ///
  /// A valid durable hit is promoted into the volatile tier. Expired,
  /// corrupt, or undecodable entries are purged and reported as a miss.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let now = self.clock.now();

    let data = match self.memory_lookup(key, now) {
      Some(data) => Some(data),
      None => self.durable_lookup(key, now).map(|entry| {
        let data = entry.data.clone();
        self.memory_insert(key, entry);
        data
      }),
    };

    let Some(data) = data else {
      self.record_miss(key);
      return None;
    };

    match serde_json::from_value(data) {
      Ok(value) => {
        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(key, "cache hit");
        Some(value)
      }
      Err(e) => {
        debug!(key, error = %e, "cached value has unexpected shape, dropping");
        self.delete(key);
        self.record_miss(key);
        None
      }
    }
  }

  /// Store `value` under `key` in both tiers.
  ///
  /// `ttl` defaults to the configured TTL. The volatile write always
  /// happens; the durable write is dropped if the store stays over quota
  /// after an expired-entry eviction and one retry.
  pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
    let data = match serde_json::to_value(value) {
      Ok(data) => data,
      Err(e) => {
        warn!(key, error = %e, "failed to serialize cache value");
        return;
      }
    };

    let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
    let entry = CacheEntry::new(data, self.clock.now(), ttl);
    let payload = serde_json::to_string(&entry);
    self.memory_insert(key, entry);

    match payload {
      Ok(payload) => self.durable_write(key, &payload),
      Err(e) => warn!(key, error = %e, "failed to serialize cache entry"),
    }
  }

  /// Remove `key` from both tiers.
  pub fn delete(&self, key: &str) {
    self.memory().remove(key);
    self.durable_remove(&durable_key(key));
  }

  /// Remove every key matching `pattern` (`*` is a wildcard), or everything
  /// when no pattern is given. Returns the number of distinct keys removed.
  pub fn clear(&self, pattern: Option<&str>) -> usize {
    let matcher = match pattern.map(glob_regex).transpose() {
      Ok(matcher) => matcher,
      Err(e) => {
        warn!(pattern, error = %e, "invalid cache key pattern");
        return 0;
      }
    };
    let matches = |key: &str| matcher.as_ref().map_or(true, |re| re.is_match(key));

    let mut removed = BTreeSet::new();
    self.memory().retain(|key, _| {
      if matches(key) {
        removed.insert(key.clone());
        false
      } else {
        true
      }
    });

    for stored in self.durable_keys() {
      let key = &stored[KEY_PREFIX.len()..];
      if matches(key) && self.durable_remove(&stored) {
        removed.insert(key.to_string());
      }
    }

    debug!(pattern, removed = removed.len(), "cleared cache entries");
    removed.len()
  }

  /// Invalidate a key scope, or every entry older than `max_age`.
  pub fn invalidate(&self, options: &InvalidateOptions) -> usize {
    match options.max_age {
      Some(max_age) => match self.clock.now().checked_sub_signed(max_age) {
        Some(cutoff) => self.purge_where(|entry| entry.created_at < cutoff),
        // Out of range means nothing can be that old
        None => 0,
      },
      None => self.clear(Some(&options.pattern())),
    }
  }

  /// Purge expired entries from both tiers.
  pub fn sweep(&self) -> usize {
    let now = self.clock.now();
    let removed = self.purge_where(|entry| !entry.is_valid(now));
    *self
      .last_sweep_at
      .lock()
      .unwrap_or_else(|e| e.into_inner()) = Some(now);
    debug!(removed, "cache sweep finished");
    removed
  }

  /// Snapshot of the cache, scanning the durable tier.
  pub fn stats(&self) -> CacheStats {
    let durable_keys = self.durable_keys();
    let durable_byte_size = durable_keys
      .iter()
      .map(|k| self.storage.size_of(k).unwrap_or(0))
      .sum();
    let hits = self.hits.load(Ordering::Relaxed);
    let misses = self.misses.load(Ordering::Relaxed);
    let total = hits + misses;

    CacheStats {
      memory_entry_count: self.memory().len(),
      durable_entry_count: durable_keys.len(),
      durable_byte_size,
      hits,
      misses,
      hit_rate: if total == 0 {
        0.0
      } else {
        hits as f64 / total as f64
      },
      durable_write_drops: self.durable_write_drops.load(Ordering::Relaxed),
      last_sweep_at: *self
        .last_sweep_at
        .lock()
        .unwrap_or_else(|e| e.into_inner()),
    }
  }

  fn memory(&self) -> MutexGuard<'_, MemoryTier> {
    self.memory.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn record_miss(&self, key: &str) {
    self.misses.fetch_add(1, Ordering::Relaxed);
    debug!(key, "cache miss");
  }

  fn memory_lookup(&self, key: &str, now: DateTime<Utc>) -> Option<Value> {
    let mut memory = self.memory();
    let entry = memory.get(key)?;
    if entry.is_valid(now) {
      return Some(entry.data.clone());
    }
    memory.remove(key);
    None
  }

  /// Insert into the volatile tier, evicting the oldest entry when a new key
  /// would exceed the bound.
  fn memory_insert(&self, key: &str, entry: CacheEntry<Value>) {
    let max = self.config.max_memory_entries;
    if max == 0 {
      return;
    }

    let mut memory = self.memory();
    if !memory.contains_key(key) && memory.len() >= max {
      let oldest = memory
        .iter()
        .min_by_key(|(_, e)| e.created_at)
        .map(|(k, _)| k.clone());
      if let Some(oldest) = oldest {
        memory.remove(&oldest);
      }
    }
    memory.insert(key.to_string(), entry);
  }

  fn durable_lookup(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry<Value>> {
    let stored = durable_key(key);
    let DurableRead::Entry(entry) = self.durable_read(&stored) else {
      return None;
    };
    if entry.is_valid(now) {
      Some(entry)
    } else {
      self.durable_remove(&stored);
      None
    }
  }

  /// Read and decode a durable entry. Undecodable or foreign-schema entries
  /// are removed.
  fn durable_read(&self, stored: &str) -> DurableRead {
    let raw = match self.storage.read(stored) {
      Ok(Some(raw)) => raw,
      Ok(None) => return DurableRead::Missing,
      Err(e) => {
        warn!(key = stored, error = %e, "durable cache read failed");
        return DurableRead::Missing;
      }
    };

    match serde_json::from_str::<CacheEntry<Value>>(&raw) {
      Ok(entry) if entry.is_current_schema() => return DurableRead::Entry(entry),
      Ok(entry) => {
        debug!(key = stored, version = %entry.schema_version, "discarding entry from old schema");
      }
      Err(e) => {
        warn!(key = stored, error = %e, "discarding corrupt durable cache entry");
      }
    }

    if self.durable_remove(stored) {
      DurableRead::Discarded
    } else {
      DurableRead::Missing
    }
  }

  fn durable_write(&self, key: &str, payload: &str) {
    let stored = durable_key(key);
    let size = (stored.len() + payload.len()) as u64;

    if !self.fits_budget(&stored, size) {
      let evicted = self.evict_expired_durable();
      debug!(key, evicted, "durable budget exceeded, evicted expired entries");
    }

    match self.try_durable_write(&stored, payload, size) {
      Ok(()) => return,
      Err(StorageError::QuotaExceeded) => {}
      Err(e) => {
        self.drop_durable_write(key, &stored, &e);
        return;
      }
    }

    self.evict_expired_durable();
    if let Err(e) = self.try_durable_write(&stored, payload, size) {
      self.drop_durable_write(key, &stored, &e);
    }
  }

  fn try_durable_write(&self, stored: &str, payload: &str, size: u64) -> StorageResult<()> {
    if !self.fits_budget(stored, size) {
      return Err(StorageError::QuotaExceeded);
    }
    self.storage.write(stored, payload)
  }

  /// The volatile copy survives; the durable copy must not lag behind it.
  fn drop_durable_write(&self, key: &str, stored: &str, error: &StorageError) {
    self.durable_write_drops.fetch_add(1, Ordering::Relaxed);
    warn!(key, error = %error, "dropping durable cache write");
    self.durable_remove(stored);
  }

  fn fits_budget(&self, stored: &str, size: u64) -> bool {
    let used: u64 = self
      .durable_keys()
      .iter()
      .filter(|k| k.as_str() != stored)
      .map(|k| self.storage.size_of(k).unwrap_or(0))
      .sum();
    used + size <= self.config.max_durable_bytes
  }

  fn evict_expired_durable(&self) -> usize {
    let now = self.clock.now();
    self
      .durable_keys()
      .into_iter()
      .filter(|stored| match self.durable_read(stored) {
        DurableRead::Entry(entry) => !entry.is_valid(now) && self.durable_remove(stored),
        DurableRead::Discarded => true,
        DurableRead::Missing => false,
      })
      .count()
  }

  /// Remove every entry, in either tier, for which `predicate` holds.
  fn purge_where(&self, predicate: impl Fn(&CacheEntry<Value>) -> bool) -> usize {
    let mut removed = BTreeSet::new();
    self.memory().retain(|key, entry| {
      if predicate(entry) {
        removed.insert(key.clone());
        false
      } else {
        true
      }
    });

    for stored in self.durable_keys() {
      let key = stored[KEY_PREFIX.len()..].to_string();
      let gone = match self.durable_read(&stored) {
        DurableRead::Entry(entry) => predicate(&entry) && self.durable_remove(&stored),
        DurableRead::Discarded => true,
        DurableRead::Missing => false,
      };
      if gone {
        removed.insert(key);
      }
    }

    removed.len()
  }

  fn durable_keys(&self) -> Vec<String> {
    self.storage.list_keys(KEY_PREFIX).unwrap_or_else(|e| {
      warn!(error = %e, "failed to list durable cache keys");
      Vec::new()
    })
  }

  /// Remove a durable key, reporting whether the backend accepted it.
  fn durable_remove(&self, stored: &str) -> bool {
    match self.storage.remove(stored) {
      Ok(()) => true,
      Err(e) => {
        warn!(key = stored, error = %e, "failed to remove durable cache entry");
        false
      }
    }
  }
}

impl<S: DurableStore + 'static> CacheEngine<S> {
  /// Run [`sweep`](Self::sweep) every `sweep_interval` until the engine is dropped.
  pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
    let engine = Arc::downgrade(&self);
    let period = self.config.sweep_interval();

    tokio::spawn(async move {
      let mut interval = tokio::time::interval(period);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately
      interval.tick().await;

      loop {
        interval.tick().await;
        match engine.upgrade() {
          Some(engine) => {
            engine.sweep();
          }
          None => break,
        }
      }
    })
  }
}

fn durable_key(key: &str) -> String {
  format!("{}{}", KEY_PREFIX, key)
}

/// Compile a glob where `*` matches any run of characters and everything
/// else is literal. The whole key must match.
fn glob_regex(pattern: &str) -> Result<Regex, regex::Error> {
  let body = pattern
    .split('*')
    .map(regex::escape)
    .collect::<Vec<_>>()
    .join(".*");
  Regex::new(&format!("^{}$", body))
}
