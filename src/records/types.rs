use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Why an incoming row could not become an [`ExternalRecord`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
  #[error("missing required field `{0}`")]
  MissingField(&'static str),
  #[error("malformed record: {0}")]
  Malformed(String),
}

/// Why a scope could not be built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
  #[error("owner id is required")]
  MissingOwner,
  #[error("period is required")]
  MissingPeriod,
  #[error("owner id '{0}' is not an 11-digit RUC")]
  InvalidOwner(String),
  #[error("period '{0}' is not YYYYMM")]
  InvalidPeriod(String),
}

/// The (owner, period) pair records are fetched and reconciled under.
///
/// The owner is a RUC (11 digits) and the period is `YYYYMM`, so neither
/// can contain the `_` that separates components in cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
  owner_id: String,
  period: String,
}

impl Scope {
  pub fn new(owner_id: &str, period: &str) -> Result<Self, ScopeError> {
    let owner_id = owner_id.trim();
    let period = period.trim();
    if owner_id.is_empty() {
      return Err(ScopeError::MissingOwner);
    }
    if period.is_empty() {
      return Err(ScopeError::MissingPeriod);
    }
    if !is_ruc(owner_id) {
      return Err(ScopeError::InvalidOwner(owner_id.to_string()));
    }
    if !is_period(period) {
      return Err(ScopeError::InvalidPeriod(period.to_string()));
    }
    Ok(Self {
      owner_id: owner_id.to_string(),
      period: period.to_string(),
    })
  }

  pub fn owner_id(&self) -> &str {
    &self.owner_id
  }

  pub fn period(&self) -> &str {
    &self.period
  }
}

fn is_ruc(s: &str) -> bool {
  s.len() == 11 && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_period(s: &str) -> bool {
  if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
    return false;
  }
  matches!(s[4..].parse::<u8>(), Ok(1..=12))
}

impl fmt::Display for Scope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.owner_id, self.period)
  }
}

/// Business identity of a fiscal document, independent of storage ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
  pub owner_id: String,
  pub document_type: String,
  pub series: String,
  pub number: String,
}

impl fmt::Display for NaturalKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}/{}/{}-{}",
      self.owner_id, self.document_type, self.series, self.number
    )
  }
}

/// The other party on a document (supplier for purchases, customer for sales).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterpart {
  pub doc_type: Option<String>,
  pub id: Option<String>,
  pub name: Option<String>,
}

/// One validated fiscal document as received from the remote source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRecord {
  pub document_type: String,
  pub series: String,
  pub number: String,
  pub issue_date: Option<NaiveDate>,
  pub due_date: Option<NaiveDate>,
  pub counterpart: Counterpart,
  pub currency: String,
  pub taxable_base: Decimal,
  pub igv: Decimal,
  pub other_charges: Decimal,
  pub total: Decimal,
  pub exchange_rate: Option<Decimal>,
}

impl ExternalRecord {
  /// Validate an untyped row from the remote source.
  pub fn from_raw(value: &serde_json::Value) -> Result<Self, RecordError> {
    if !value.is_object() {
      return Err(RecordError::Malformed("expected a JSON object".to_string()));
    }
    let api: super::api_types::ApiRecord =
      serde_json::from_value(value.clone()).map_err(|e| RecordError::Malformed(e.to_string()))?;
    api.into_record()
  }

  pub fn natural_key(&self, owner_id: &str) -> NaturalKey {
    NaturalKey {
      owner_id: owner_id.to_string(),
      document_type: self.document_type.clone(),
      series: self.series.clone(),
      number: self.number.clone(),
    }
  }

  /// SHA-256 over the comparable fields. Amounts are normalized so that
  /// `118.00` and `118.0` hash the same. Each field is length prefixed, so
  /// free text containing separators cannot shift content between fields.
  pub fn content_hash(&self) -> String {
    let fields = [
      self.issue_date.map(|d| d.to_string()),
      self.due_date.map(|d| d.to_string()),
      self.counterpart.doc_type.clone(),
      self.counterpart.id.clone(),
      self.counterpart.name.clone(),
      Some(self.currency.clone()),
      Some(self.taxable_base.normalize().to_string()),
      Some(self.igv.normalize().to_string()),
      Some(self.other_charges.normalize().to_string()),
      Some(self.total.normalize().to_string()),
      self.exchange_rate.map(|r| r.normalize().to_string()),
    ];

    let mut hasher = Sha256::new();
    for field in &fields {
      match field {
        Some(value) => {
          hasher.update([1u8]);
          hasher.update((value.len() as u64).to_be_bytes());
          hasher.update(value.as_bytes());
        }
        None => hasher.update([0u8]),
      }
    }
    hex::encode(hasher.finalize())
  }
}

/// Persisted form of an [`ExternalRecord`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
  pub id: i64,
  pub scope: Scope,
  pub record: ExternalRecord,
  pub first_seen_at: DateTime<Utc>,
  pub last_updated_at: DateTime<Utc>,
  pub source_revision_hash: String,
}

impl StoredRecord {
  pub fn natural_key(&self) -> NaturalKey {
    self.record.natural_key(self.scope.owner_id())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rust_decimal_macros::dec;
  use serde_json::json;

  fn invoice(total: serde_json::Value) -> ExternalRecord {
    ExternalRecord::from_raw(&json!({
      "documentType": "01",
      "series": "F001",
      "number": "123",
      "issueDate": "2024-08-05",
      "counterpartId": "20100000001",
      "total": total
    }))
    .unwrap()
  }

  #[test]
  fn test_scope_requires_both_parts() {
    assert_eq!(Scope::new("", "202408"), Err(ScopeError::MissingOwner));
    assert_eq!(Scope::new("20612969125", "  "), Err(ScopeError::MissingPeriod));

    assert_eq!(
      Scope::new("2061_296912", "202408"),
      Err(ScopeError::InvalidOwner("2061_296912".to_string()))
    );
    assert_eq!(
      Scope::new("20612969125", "2024_08"),
      Err(ScopeError::InvalidPeriod("2024_08".to_string()))
    );
    assert!(matches!(
      Scope::new("20612969125", "202413"),
      Err(ScopeError::InvalidPeriod(_))
    ));
    assert!(matches!(
      Scope::new("2061296912", "202408"),
      Err(ScopeError::InvalidOwner(_))
    ));

    let scope = Scope::new(" 20612969125 ", "202408").unwrap();
    assert_eq!(scope.owner_id(), "20612969125");
    assert_eq!(scope.to_string(), "20612969125/202408");
  }

  #[test]
  fn test_natural_key_display() {
    let key = invoice(json!("118.00")).natural_key("20612969125");
    assert_eq!(key.to_string(), "20612969125/01/F001-123");
  }

  #[test]
  fn test_hash_ignores_amount_scale() {
    assert_eq!(
      invoice(json!("118.00")).content_hash(),
      invoice(json!(118)).content_hash()
    );
  }

  #[test]
  fn test_hash_tracks_amount_changes() {
    let before = invoice(json!("118.00"));
    let after = invoice(json!("120.00"));
    assert_eq!(after.total, dec!(120));
    assert_ne!(before.content_hash(), after.content_hash());
  }

  #[test]
  fn test_hash_keeps_fields_apart() {
    let mut left = invoice(json!("118.00"));
    left.counterpart.name = Some("ACME|PEN".to_string());
    left.currency = "USD".to_string();

    let mut right = invoice(json!("118.00"));
    right.counterpart.name = Some("ACME".to_string());
    right.currency = "PEN|USD".to_string();

    assert_ne!(left.content_hash(), right.content_hash());
  }

  #[test]
  fn test_from_raw_rejects_non_objects() {
    assert!(matches!(
      ExternalRecord::from_raw(&json!("F001-123")),
      Err(RecordError::Malformed(_))
    ));
    assert!(matches!(
      ExternalRecord::from_raw(&json!({ "documentType": "01", "series": "F001", "number": "1", "total": "abc" })),
      Err(RecordError::Malformed(_))
    ));
  }

  #[test]
  fn test_record_survives_json_round_trip() {
    let record = invoice(json!("118.00"));
    let json = serde_json::to_string(&record).unwrap();
    let back: ExternalRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(back.content_hash(), record.content_hash());
  }
}
