//! Merge freshly fetched records into the record store without duplicating
//! or losing rows.
//!
//! Each record is matched to stored state by its natural key
//! `(owner, document type, series, number)` within the `(owner, period)`
//! scope and classified as new, updated (content hash changed) or
//! unchanged. Running the same batch twice leaves the store untouched the
//! second time.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::records::{ExternalRecord, NaturalKey, Scope, ScopeError};
use crate::store::{RecordStore, UpsertOutcome};

/// Scope-level precondition failure. Per-record problems never surface here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
  #[error("cannot reconcile: {0}")]
  InvalidScope(#[from] ScopeError),
}

/// A record that could not be reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
  /// Position in the input batch
  pub index: usize,
  /// Natural key when the record got far enough to have one
  pub natural_key: Option<String>,
  pub message: String,
}

/// Summary of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationResult {
  pub total_processed: usize,
  pub total_new: usize,
  pub total_updated: usize,
  pub total_unchanged: usize,
  pub total_errors: usize,
  pub errors: Vec<RecordFailure>,
}

impl ReconciliationResult {
  pub fn is_partial(&self) -> bool {
    self.total_errors > 0
  }
}

pub struct ReconciliationService<R: RecordStore> {
  store: Arc<R>,
  clock: Arc<dyn Clock>,
}

impl<R: RecordStore> ReconciliationService<R> {
  pub fn new(store: Arc<R>) -> Self {
    Self {
      store,
      clock: Arc::new(SystemClock),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn store(&self) -> &Arc<R> {
    &self.store
  }

  /// Reconcile `records` into the store under `(owner_id, period)`.
  ///
  /// Records are processed in input order. When several rows share a
  /// natural key only the last one is written; the earlier ones count as
  /// unchanged. A record that fails validation or is rejected by the store
  /// is reported in `errors` and the batch carries on. Only an invalid
  /// owner or period aborts.
  pub fn reconcile(
    &self,
    owner_id: &str,
    period: &str,
    records: &[Value],
  ) -> Result<ReconciliationResult, ReconcileError> {
    let scope = Scope::new(owner_id, period)?;
    let mut result = ReconciliationResult {
      total_processed: records.len(),
      ..ReconciliationResult::default()
    };

    let parsed: Vec<_> = records.iter().map(ExternalRecord::from_raw).collect();

    // Within one batch the last row for a natural key wins
    let mut last_row: HashMap<NaturalKey, usize> = HashMap::new();
    for (index, record) in parsed.iter().enumerate() {
      if let Ok(record) = record {
        last_row.insert(record.natural_key(scope.owner_id()), index);
      }
    }

    for (index, record) in parsed.into_iter().enumerate() {
      let record = match record {
        Ok(record) => record,
        Err(e) => {
          warn!(scope = %scope, index, error = %e, "rejecting malformed record");
          result.errors.push(RecordFailure {
            index,
            natural_key: None,
            message: e.to_string(),
          });
          continue;
        }
      };

      let key = record.natural_key(scope.owner_id());
      if last_row.get(&key) != Some(&index) {
        debug!(key = %key, index, "superseded by a later row in the batch");
        result.total_unchanged += 1;
        continue;
      }

      let hash = record.content_hash();
      match self.store.upsert(&scope, &record, &hash, self.clock.now()) {
        Ok(UpsertOutcome::Inserted(_)) => result.total_new += 1,
        Ok(UpsertOutcome::Updated(_)) => {
          debug!(key = %key, "record content changed");
          result.total_updated += 1;
        }
        Ok(UpsertOutcome::Unchanged(_)) => result.total_unchanged += 1,
        Err(e) => {
          warn!(key = %key, error = %e, "failed to store record");
          result.errors.push(RecordFailure {
            index,
            natural_key: Some(key.to_string()),
            message: e.to_string(),
          });
        }
      }
    }

    result.total_errors = result.errors.len();
    info!(
      scope = %scope,
      processed = result.total_processed,
      new = result.total_new,
      updated = result.total_updated,
      unchanged = result.total_unchanged,
      errors = result.total_errors,
      "reconciliation finished"
    );
    Ok(result)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::records::StoredRecord;
  use crate::store::{RecordStoreError, SqliteRecordStore, StoreResult};
  use chrono::{DateTime, Duration, TimeZone, Utc};
  use serde_json::json;
  use std::collections::BTreeSet;

  const OWNER: &str = "20612969125";
  const PERIOD: &str = "202408";

  fn invoice(series: &str, number: &str, total: &str) -> Value {
    json!({
      "documentType": "01",
      "series": series,
      "number": number,
      "issueDate": "2024-08-10",
      "counterpartDocType": "6",
      "counterpartId": "20100000001",
      "currency": "PEN",
      "total": total
    })
  }

  fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 1, 9, 0, 0).unwrap()
  }

  fn service() -> (
    ReconciliationService<SqliteRecordStore>,
    Arc<SqliteRecordStore>,
    Arc<ManualClock>,
  ) {
    let store = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let service = ReconciliationService::new(store.clone()).with_clock(clock.clone());
    (service, store, clock)
  }

  fn counts(result: &ReconciliationResult) -> (usize, usize, usize, usize) {
    (
      result.total_new,
      result.total_updated,
      result.total_unchanged,
      result.total_errors,
    )
  }

  #[test]
  fn test_scenario_new_then_updated() {
    let (service, store, clock) = service();
    let scope = Scope::new(OWNER, PERIOD).unwrap();

    let first = vec![
      invoice("F001", "123", "118.00"),
      invoice("F002", "456", "236.00"),
    ];
    let result = service.reconcile(OWNER, PERIOD, &first).unwrap();
    assert_eq!(counts(&result), (2, 0, 0, 0));
    assert_eq!(result.total_processed, 2);

    clock.advance(Duration::hours(2));
    let second = vec![
      invoice("F001", "123", "120.00"),
      invoice("F002", "456", "236.00"),
    ];
    let result = service.reconcile(OWNER, PERIOD, &second).unwrap();
    assert_eq!(counts(&result), (0, 1, 1, 0));

    let stored = store.list(&scope).unwrap();
    assert_eq!(stored.len(), 2);
    let f001 = stored.iter().find(|r| r.record.series == "F001").unwrap();
    assert_eq!(f001.first_seen_at, t0());
    assert_eq!(f001.last_updated_at, t0() + Duration::hours(2));
    let f002 = stored.iter().find(|r| r.record.series == "F002").unwrap();
    assert_eq!(f002.last_updated_at, t0());
  }

  #[test]
  fn test_reconcile_is_idempotent() {
    let (service, store, _) = service();
    let scope = Scope::new(OWNER, PERIOD).unwrap();
    let batch: Vec<Value> = (1..=25)
      .map(|n| invoice("F001", &n.to_string(), &format!("{}.50", n)))
      .collect();

    service.reconcile(OWNER, PERIOD, &batch).unwrap();
    let before = store.list(&scope).unwrap();

    let result = service.reconcile(OWNER, PERIOD, &batch).unwrap();
    assert_eq!(counts(&result), (0, 0, 25, 0));
    assert_eq!(store.list(&scope).unwrap(), before);
  }

  #[test]
  fn test_no_duplicate_natural_keys() {
    let (service, store, _) = service();
    let scope = Scope::new(OWNER, PERIOD).unwrap();

    // Same document under different spellings, within and across batches
    let batches = vec![
      vec![invoice("F001", "123", "1"), invoice("f001", "00123", "1")],
      vec![invoice("F001", "123", "2"), invoice("F001", "124", "2")],
      vec![invoice("F001", "0124", "3")],
    ];
    for batch in &batches {
      service.reconcile(OWNER, PERIOD, batch).unwrap();
    }

    let stored = store.list(&scope).unwrap();
    let keys: BTreeSet<NaturalKey> = stored.iter().map(StoredRecord::natural_key).collect();
    assert_eq!(stored.len(), keys.len());
    assert_eq!(stored.len(), 2);
  }

  #[test]
  fn test_conflicting_rows_in_one_batch_settle() {
    let (service, store, clock) = service();
    let scope = Scope::new(OWNER, PERIOD).unwrap();
    let batch = vec![
      invoice("F001", "123", "118.00"),
      invoice("f001", "0123", "120.00"),
      invoice("F002", "1", "5.00"),
    ];

    let first = service.reconcile(OWNER, PERIOD, &batch).unwrap();
    assert_eq!(counts(&first), (2, 0, 1, 0));
    let before = store.list(&scope).unwrap();
    let f001 = before.iter().find(|r| r.record.series == "F001").unwrap();
    assert_eq!(f001.record.total.to_string(), "120.00");

    clock.advance(Duration::hours(1));
    let second = service.reconcile(OWNER, PERIOD, &batch).unwrap();
    assert_eq!(counts(&second), (0, 0, 3, 0));
    assert_eq!(store.list(&scope).unwrap(), before);
  }

  #[test]
  fn test_malformed_record_is_isolated() {
    let (service, _, _) = service();
    service
      .reconcile(OWNER, PERIOD, &[invoice("F001", "1", "10.00")])
      .unwrap();

    let batch = vec![
      invoice("F001", "1", "10.00"),
      json!({ "documentType": "01", "number": "2", "total": "5.00" }),
      invoice("F001", "1", "10.00"),
      invoice("F001", "3", "7.00"),
    ];
    let result = service.reconcile(OWNER, PERIOD, &batch).unwrap();

    assert_eq!(result.total_processed, 4);
    assert_eq!(counts(&result), (1, 0, 2, 1));
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].index, 1);
    assert_eq!(result.errors[0].natural_key, None);
    assert!(result.errors[0].message.contains("series"));
    assert!(result.is_partial());
  }

  #[test]
  fn test_empty_batch() {
    let (service, _, _) = service();
    let result = service.reconcile(OWNER, PERIOD, &[]).unwrap();
    assert_eq!(result, ReconciliationResult::default());
  }

  #[test]
  fn test_missing_scope_aborts() {
    let (service, _, _) = service();
    let batch = vec![invoice("F001", "1", "1")];

    assert_eq!(
      service.reconcile("", PERIOD, &batch),
      Err(ReconcileError::InvalidScope(ScopeError::MissingOwner))
    );
    assert_eq!(
      service.reconcile(OWNER, " ", &batch),
      Err(ReconcileError::InvalidScope(ScopeError::MissingPeriod))
    );
  }

  /// Store that refuses to write one particular series.
  struct RejectingStore {
    inner: SqliteRecordStore,
    rejected_series: &'static str,
  }

  impl RecordStore for RejectingStore {
    fn find_by_natural_key(
      &self,
      scope: &Scope,
      key: &NaturalKey,
    ) -> StoreResult<Option<StoredRecord>> {
      self.inner.find_by_natural_key(scope, key)
    }

    fn insert(
      &self,
      scope: &Scope,
      record: &ExternalRecord,
      hash: &str,
      now: DateTime<Utc>,
    ) -> StoreResult<StoredRecord> {
      if record.series == self.rejected_series {
        return Err(RecordStoreError::Unavailable("write rejected".to_string()));
      }
      self.inner.insert(scope, record, hash, now)
    }

    fn update(
      &self,
      id: i64,
      record: &ExternalRecord,
      hash: &str,
      now: DateTime<Utc>,
    ) -> StoreResult<StoredRecord> {
      self.inner.update(id, record, hash, now)
    }

    fn list(&self, scope: &Scope) -> StoreResult<Vec<StoredRecord>> {
      self.inner.list(scope)
    }
  }

  #[test]
  fn test_store_failure_is_isolated() {
    let store = Arc::new(RejectingStore {
      inner: SqliteRecordStore::open_in_memory().unwrap(),
      rejected_series: "B001",
    });
    let service = ReconciliationService::new(store.clone());

    let batch = vec![
      invoice("F001", "1", "1"),
      invoice("B001", "1", "1"),
      invoice("F001", "2", "1"),
    ];
    let result = service.reconcile(OWNER, PERIOD, &batch).unwrap();

    assert_eq!(counts(&result), (2, 0, 0, 1));
    assert_eq!(
      result.errors[0].natural_key.as_deref(),
      Some("20612969125/01/B001-1")
    );
    let scope = Scope::new(OWNER, PERIOD).unwrap();
    assert_eq!(store.list(&scope).unwrap().len(), 2);
  }

  #[test]
  fn test_scopes_are_independent() {
    let (service, _, _) = service();
    let batch = vec![invoice("F001", "1", "1")];

    let first = service.reconcile(OWNER, "202408", &batch).unwrap();
    let second = service.reconcile(OWNER, "202409", &batch).unwrap();
    assert_eq!(first.total_new, 1);
    assert_eq!(second.total_new, 1);
  }
}
