//! SQLite record store with a unique natural-key index.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{RecordStore, RecordStoreError, StoreResult, UpsertOutcome};
use crate::db;
use crate::records::{ExternalRecord, NaturalKey, Scope, StoredRecord};

const SELECT_COLUMNS: &str = "SELECT id, owner_id, period, data, source_revision_hash, first_seen_at, last_updated_at
   FROM stored_records";

/// SQLite-backed [`RecordStore`].
pub struct SqliteRecordStore {
  conn: Mutex<Connection>,
}

impl SqliteRecordStore {
  /// Open the store in the database at `path`.
  pub fn open(path: &Path) -> color_eyre::Result<Self> {
    Self::from_connection(db::open(path)?)
  }

  /// Open a throwaway in-memory store.
  pub fn open_in_memory() -> color_eyre::Result<Self> {
    Self::from_connection(db::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> color_eyre::Result<Self> {
    // Another process may hold the write lock briefly
    conn.busy_timeout(Duration::from_secs(5))?;
    db::migrate(&conn, db::schema::RECORDS_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Number of records stored for `scope`.
  pub fn count(&self, scope: &Scope) -> StoreResult<usize> {
    let conn = self.lock()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM stored_records WHERE owner_id = ? AND period = ?",
      params![scope.owner_id(), scope.period()],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }

  fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| RecordStoreError::Unavailable(format!("Lock poisoned: {}", e)))
  }
}

/// Raw column values, decoded outside the rusqlite row closure.
struct Row {
  id: i64,
  owner_id: String,
  period: String,
  data: String,
  hash: String,
  first_seen_at: String,
  last_updated_at: String,
}

impl Row {
  fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      owner_id: row.get(1)?,
      period: row.get(2)?,
      data: row.get(3)?,
      hash: row.get(4)?,
      first_seen_at: row.get(5)?,
      last_updated_at: row.get(6)?,
    })
  }

  fn into_stored(self) -> StoreResult<StoredRecord> {
    let scope = Scope::new(&self.owner_id, &self.period)
      .map_err(|e| RecordStoreError::Corrupt(format!("record {}: {}", self.id, e)))?;
    Ok(StoredRecord {
      id: self.id,
      scope,
      record: serde_json::from_str(&self.data)?,
      first_seen_at: parse_timestamp(&self.first_seen_at)?,
      last_updated_at: parse_timestamp(&self.last_updated_at)?,
      source_revision_hash: self.hash,
    })
  }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(s: &str) -> StoreResult<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| RecordStoreError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}

fn find_in(conn: &Connection, scope: &Scope, key: &NaturalKey) -> StoreResult<Option<StoredRecord>> {
  let sql = format!(
    "{} WHERE owner_id = ? AND period = ? AND document_type = ? AND series = ? AND number = ?",
    SELECT_COLUMNS
  );
  conn
    .query_row(
      &sql,
      params![
        scope.owner_id(),
        scope.period(),
        key.document_type,
        key.series,
        key.number
      ],
      Row::read,
    )
    .optional()?
    .map(Row::into_stored)
    .transpose()
}

fn get_in(conn: &Connection, id: i64) -> StoreResult<StoredRecord> {
  let sql = format!("{} WHERE id = ?", SELECT_COLUMNS);
  conn
    .query_row(&sql, params![id], Row::read)
    .optional()?
    .ok_or(RecordStoreError::NotFound(id))?
    .into_stored()
}

fn insert_in(
  conn: &Connection,
  scope: &Scope,
  record: &ExternalRecord,
  hash: &str,
  now: DateTime<Utc>,
) -> StoreResult<StoredRecord> {
  // Stored timestamps keep milliseconds only
  let now = now.trunc_subsecs(3);
  let data = serde_json::to_string(record)?;
  let stamp = format_timestamp(now);
  conn.execute(
    "INSERT INTO stored_records
       (owner_id, period, document_type, series, number, data, source_revision_hash, first_seen_at, last_updated_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    params![
      scope.owner_id(),
      scope.period(),
      record.document_type,
      record.series,
      record.number,
      data,
      hash,
      stamp,
      stamp
    ],
  )?;

  Ok(StoredRecord {
    id: conn.last_insert_rowid(),
    scope: scope.clone(),
    record: record.clone(),
    first_seen_at: now,
    last_updated_at: now,
    source_revision_hash: hash.to_string(),
  })
}

fn update_in(
  conn: &Connection,
  id: i64,
  record: &ExternalRecord,
  hash: &str,
  now: DateTime<Utc>,
) -> StoreResult<StoredRecord> {
  let data = serde_json::to_string(record)?;
  let changed = conn.execute(
    "UPDATE stored_records SET data = ?, source_revision_hash = ?, last_updated_at = ? WHERE id = ?",
    params![data, hash, format_timestamp(now), id],
  )?;
  if changed == 0 {
    return Err(RecordStoreError::NotFound(id));
  }
  get_in(conn, id)
}

impl RecordStore for SqliteRecordStore {
  fn find_by_natural_key(&self, scope: &Scope, key: &NaturalKey) -> StoreResult<Option<StoredRecord>> {
    let conn = self.lock()?;
    find_in(&conn, scope, key)
  }

  fn insert(
    &self,
    scope: &Scope,
    record: &ExternalRecord,
    hash: &str,
    now: DateTime<Utc>,
  ) -> StoreResult<StoredRecord> {
    let conn = self.lock()?;
    insert_in(&conn, scope, record, hash, now)
  }

  fn update(
    &self,
    id: i64,
    record: &ExternalRecord,
    hash: &str,
    now: DateTime<Utc>,
  ) -> StoreResult<StoredRecord> {
    let conn = self.lock()?;
    update_in(&conn, id, record, hash, now)
  }

  fn list(&self, scope: &Scope) -> StoreResult<Vec<StoredRecord>> {
    let conn = self.lock()?;
    let sql = format!(
      "{} WHERE owner_id = ? AND period = ? ORDER BY document_type, series, number",
      SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
      .query_map(params![scope.owner_id(), scope.period()], Row::read)?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(Row::into_stored).collect()
  }

  /// Lookup and write happen in one immediate transaction, so concurrent
  /// callers cannot both decide to insert the same natural key.
  fn upsert(
    &self,
    scope: &Scope,
    record: &ExternalRecord,
    hash: &str,
    now: DateTime<Utc>,
  ) -> StoreResult<UpsertOutcome> {
    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let key = record.natural_key(scope.owner_id());

    let outcome = match find_in(&tx, scope, &key)? {
      None => UpsertOutcome::Inserted(insert_in(&tx, scope, record, hash, now)?),
      Some(existing) if existing.source_revision_hash == hash => UpsertOutcome::Unchanged(existing),
      Some(existing) => UpsertOutcome::Updated(update_in(&tx, existing.id, record, hash, now)?),
    };

    tx.commit()?;
    Ok(outcome)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Duration, TimeZone};
  use serde_json::json;

  fn record(number: &str, total: &str) -> ExternalRecord {
    ExternalRecord::from_raw(&json!({
      "documentType": "01",
      "series": "F001",
      "number": number,
      "total": total
    }))
    .unwrap()
  }

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 2, 8, 30, 0).unwrap()
  }

  fn scope() -> Scope {
    Scope::new("20612969125", "202408").unwrap()
  }

  #[test]
  fn test_insert_and_find() {
    let store = SqliteRecordStore::open_in_memory().unwrap();
    let rec = record("123", "118.00");
    let inserted = store.insert(&scope(), &rec, &rec.content_hash(), t0()).unwrap();

    let found = store
      .find_by_natural_key(&scope(), &rec.natural_key("20612969125"))
      .unwrap()
      .unwrap();
    assert_eq!(found, inserted);
    assert_eq!(found.first_seen_at, t0());

    let other_period = Scope::new("20612969125", "202409").unwrap();
    assert!(store
      .find_by_natural_key(&other_period, &rec.natural_key("20612969125"))
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_inserted_record_matches_stored_precision() {
    let store = SqliteRecordStore::open_in_memory().unwrap();
    let rec = record("7", "1.00");
    let now = t0() + Duration::nanoseconds(123_456_789);
    let inserted = store.insert(&scope(), &rec, &rec.content_hash(), now).unwrap();

    let found = store
      .find_by_natural_key(&scope(), &rec.natural_key("20612969125"))
      .unwrap()
      .unwrap();
    assert_eq!(found, inserted);
    assert_eq!(inserted.first_seen_at, t0() + Duration::milliseconds(123));
  }

  #[test]
  fn test_unique_natural_key() {
    let store = SqliteRecordStore::open_in_memory().unwrap();
    let rec = record("123", "118.00");
    store.insert(&scope(), &rec, "a", t0()).unwrap();

    let err = store.insert(&scope(), &rec, "b", t0()).unwrap_err();
    assert!(matches!(err, RecordStoreError::Database(_)));
    assert_eq!(store.count(&scope()).unwrap(), 1);
  }

  #[test]
  fn test_update_bumps_last_updated() {
    let store = SqliteRecordStore::open_in_memory().unwrap();
    let rec = record("123", "118.00");
    let inserted = store.insert(&scope(), &rec, &rec.content_hash(), t0()).unwrap();

    let changed = record("123", "120.00");
    let later = t0() + Duration::hours(1);
    let updated = store
      .update(inserted.id, &changed, &changed.content_hash(), later)
      .unwrap();

    assert_eq!(updated.id, inserted.id);
    assert_eq!(updated.first_seen_at, t0());
    assert_eq!(updated.last_updated_at, later);
    assert_eq!(updated.record, changed);
  }

  #[test]
  fn test_update_missing_id() {
    let store = SqliteRecordStore::open_in_memory().unwrap();
    let rec = record("1", "1");
    assert!(matches!(
      store.update(42, &rec, "h", t0()),
      Err(RecordStoreError::NotFound(42))
    ));
  }

  #[test]
  fn test_upsert_classifies() {
    let store = SqliteRecordStore::open_in_memory().unwrap();
    let rec = record("123", "118.00");
    let hash = rec.content_hash();

    assert!(matches!(
      store.upsert(&scope(), &rec, &hash, t0()).unwrap(),
      UpsertOutcome::Inserted(_)
    ));
    assert!(matches!(
      store.upsert(&scope(), &rec, &hash, t0()).unwrap(),
      UpsertOutcome::Unchanged(_)
    ));

    let changed = record("123", "120.00");
    let outcome = store
      .upsert(&scope(), &changed, &changed.content_hash(), t0())
      .unwrap();
    assert!(matches!(outcome, UpsertOutcome::Updated(_)));
    assert_eq!(outcome.record().source_revision_hash, changed.content_hash());
    assert_eq!(store.count(&scope()).unwrap(), 1);
  }

  #[test]
  fn test_concurrent_upserts_do_not_duplicate() {
    let store = std::sync::Arc::new(SqliteRecordStore::open_in_memory().unwrap());
    let handles: Vec<_> = (0..8)
      .map(|_| {
        let store = store.clone();
        std::thread::spawn(move || {
          for n in 0..20 {
            let rec = record(&n.to_string(), "10.00");
            store.upsert(&scope(), &rec, &rec.content_hash(), t0()).unwrap();
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }

    assert_eq!(store.count(&scope()).unwrap(), 20);
  }

  #[test]
  fn test_list_is_scoped_and_ordered() {
    let store = SqliteRecordStore::open_in_memory().unwrap();
    for n in ["9", "10", "2"] {
      let rec = record(n, "1");
      store.insert(&scope(), &rec, "h", t0()).unwrap();
    }
    let other = Scope::new("20100000001", "202408").unwrap();
    store.insert(&other, &record("1", "1"), "h", t0()).unwrap();

    let numbers: Vec<String> = store
      .list(&scope())
      .unwrap()
      .into_iter()
      .map(|r| r.record.number)
      .collect();
    assert_eq!(numbers, vec!["10", "2", "9"]);
  }
}
