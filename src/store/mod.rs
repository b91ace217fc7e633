//! Durable record store for reconciled fiscal documents.

mod sqlite;

use chrono::{DateTime, Utc};

use crate::records::{ExternalRecord, NaturalKey, Scope, StoredRecord};

pub use sqlite::SqliteRecordStore;

#[derive(Debug, thiserror::Error)]
pub enum RecordStoreError {
  #[error("database error: {0}")]
  Database(#[from] rusqlite::Error),
  #[error("failed to encode record: {0}")]
  Encoding(#[from] serde_json::Error),
  #[error("stored record {0} not found")]
  NotFound(i64),
  #[error("corrupt stored record: {0}")]
  Corrupt(String),
  #[error("record store unavailable: {0}")]
  Unavailable(String),
}

pub type StoreResult<T> = Result<T, RecordStoreError>;

/// What an upsert did to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
  Inserted(StoredRecord),
  Updated(StoredRecord),
  Unchanged(StoredRecord),
}

impl UpsertOutcome {
  pub fn record(&self) -> &StoredRecord {
    match self {
      UpsertOutcome::Inserted(r) | UpsertOutcome::Updated(r) | UpsertOutcome::Unchanged(r) => r,
    }
  }
}

/// Trait for record store backends.
///
/// Natural keys are unique within a scope. Backends used by more than one
/// writer must override [`upsert`](RecordStore::upsert) with an atomic
/// version; the provided one is a plain lookup followed by a write.
pub trait RecordStore: Send + Sync {
  /// Find the record with `key` in `scope`.
  fn find_by_natural_key(&self, scope: &Scope, key: &NaturalKey) -> StoreResult<Option<StoredRecord>>;

  /// Insert a record first seen at `now`.
  fn insert(
    &self,
    scope: &Scope,
    record: &ExternalRecord,
    hash: &str,
    now: DateTime<Utc>,
  ) -> StoreResult<StoredRecord>;

  /// Replace the mutable fields of record `id` and bump `last_updated_at`.
  fn update(
    &self,
    id: i64,
    record: &ExternalRecord,
    hash: &str,
    now: DateTime<Utc>,
  ) -> StoreResult<StoredRecord>;

  /// All records in `scope`, ordered by natural key.
  fn list(&self, scope: &Scope) -> StoreResult<Vec<StoredRecord>>;

  /// Insert, update or leave alone depending on the stored revision hash.
  fn upsert(
    &self,
    scope: &Scope,
    record: &ExternalRecord,
    hash: &str,
    now: DateTime<Utc>,
  ) -> StoreResult<UpsertOutcome> {
    let key = record.natural_key(scope.owner_id());
    match self.find_by_natural_key(scope, &key)? {
      None => Ok(UpsertOutcome::Inserted(self.insert(scope, record, hash, now)?)),
      Some(existing) if existing.source_revision_hash == hash => {
        Ok(UpsertOutcome::Unchanged(existing))
      }
      Some(existing) => Ok(UpsertOutcome::Updated(self.update(
        existing.id,
        record,
        hash,
        now,
      )?)),
    }
  }
}

impl<T: RecordStore + ?Sized> RecordStore for std::sync::Arc<T> {
  fn find_by_natural_key(&self, scope: &Scope, key: &NaturalKey) -> StoreResult<Option<StoredRecord>> {
    (**self).find_by_natural_key(scope, key)
  }

  fn insert(
    &self,
    scope: &Scope,
    record: &ExternalRecord,
    hash: &str,
    now: DateTime<Utc>,
  ) -> StoreResult<StoredRecord> {
    (**self).insert(scope, record, hash, now)
  }

  fn update(
    &self,
    id: i64,
    record: &ExternalRecord,
    hash: &str,
    now: DateTime<Utc>,
  ) -> StoreResult<StoredRecord> {
    (**self).update(id, record, hash, now)
  }

  fn list(&self, scope: &Scope) -> StoreResult<Vec<StoredRecord>> {
    (**self).list(scope)
  }

  fn upsert(
    &self,
    scope: &Scope,
    record: &ExternalRecord,
    hash: &str,
    now: DateTime<Utc>,
  ) -> StoreResult<UpsertOutcome> {
    (**self).upsert(scope, record, hash, now)
  }
}
