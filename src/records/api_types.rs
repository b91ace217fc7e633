//! Serde-deserializable shape of a ledger row as delivered by the remote source.
//!
//! Every field is optional here; validation into [`ExternalRecord`] happens
//! in [`ApiRecord::into_record`] so a bad row becomes a record-level error
//! instead of failing the whole batch.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{de, Deserialize, Deserializer};
use serde_json::Value;

use super::types::{Counterpart, ExternalRecord, RecordError};

/// Accepts a string or a bare JSON number; blank strings count as absent.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
  D: Deserializer<'de>,
{
  match Option::<Value>::deserialize(deserializer)? {
    None | Some(Value::Null) => Ok(None),
    Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
    Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
    Some(Value::Number(n)) => Ok(Some(n.to_string())),
    Some(other) => Err(de::Error::custom(format!(
      "expected string or number, got {}",
      other
    ))),
  }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRecord {
  #[serde(default, alias = "codTipoCDP", deserialize_with = "string_or_number")]
  pub document_type: Option<String>,
  #[serde(default, alias = "numSerieCDP", deserialize_with = "string_or_number")]
  pub series: Option<String>,
  #[serde(default, alias = "numCDP", deserialize_with = "string_or_number")]
  pub number: Option<String>,
  #[serde(default, alias = "fecEmisionCDP", deserialize_with = "string_or_number")]
  pub issue_date: Option<String>,
  #[serde(default, alias = "fecVencPag", deserialize_with = "string_or_number")]
  pub due_date: Option<String>,
  #[serde(
    default,
    alias = "codTipoDocIdentidadProveedor",
    deserialize_with = "string_or_number"
  )]
  pub counterpart_doc_type: Option<String>,
  #[serde(
    default,
    alias = "numDocIdentidadProveedor",
    deserialize_with = "string_or_number"
  )]
  pub counterpart_id: Option<String>,
  #[serde(default, alias = "nomRazonSocialProveedor")]
  pub counterpart_name: Option<String>,
  #[serde(default, alias = "codMoneda")]
  pub currency: Option<String>,
  #[serde(default, alias = "mtoBIGravadaDG")]
  pub taxable_base: Option<Decimal>,
  #[serde(default, alias = "mtoIgvIpmDG")]
  pub igv: Option<Decimal>,
  #[serde(default, alias = "mtoOtrosTrib")]
  pub other_charges: Option<Decimal>,
  #[serde(default, alias = "mtoTotalCp")]
  pub total: Option<Decimal>,
  #[serde(default, alias = "mtoTipoCambio")]
  pub exchange_rate: Option<Decimal>,
}

impl ApiRecord {
  /// Validate and normalize into a domain record.
  pub fn into_record(self) -> Result<ExternalRecord, RecordError> {
    let document_type = self
      .document_type
      .ok_or(RecordError::MissingField("documentType"))?;
    let series = self.series.ok_or(RecordError::MissingField("series"))?;
    let number = self.number.ok_or(RecordError::MissingField("number"))?;

    Ok(ExternalRecord {
      document_type: normalize_document_type(&document_type),
      series: series.to_uppercase(),
      number: normalize_number(&number),
      issue_date: self
        .issue_date
        .as_deref()
        .map(|d| parse_date("issueDate", d))
        .transpose()?,
      due_date: self
        .due_date
        .as_deref()
        .map(|d| parse_date("dueDate", d))
        .transpose()?,
      counterpart: Counterpart {
        doc_type: self.counterpart_doc_type,
        id: self.counterpart_id,
        name: self
          .counterpart_name
          .map(|n| n.trim().to_string())
          .filter(|n| !n.is_empty()),
      },
      currency: self
        .currency
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "PEN".to_string()),
      taxable_base: self.taxable_base.unwrap_or_default(),
      igv: self.igv.unwrap_or_default(),
      other_charges: self.other_charges.unwrap_or_default(),
      total: self.total.unwrap_or_default(),
      exchange_rate: self.exchange_rate,
    })
  }
}

/// Single-digit numeric codes are zero padded ("1" and "01" are both invoices).
fn normalize_document_type(raw: &str) -> String {
  if raw.len() < 2 && raw.chars().all(|c| c.is_ascii_digit()) {
    format!("{:0>2}", raw)
  } else {
    raw.to_string()
  }
}

/// "00123" and "123" name the same document.
fn normalize_number(raw: &str) -> String {
  let trimmed = raw.trim_start_matches('0');
  if trimmed.is_empty() {
    "0".to_string()
  } else {
    trimmed.to_string()
  }
}

/// Dates arrive either ISO formatted or as dd/mm/yyyy.
fn parse_date(field: &'static str, raw: &str) -> Result<NaiveDate, RecordError> {
  NaiveDate::parse_from_str(raw, "%Y-%m-%d")
    .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
    .map_err(|_| RecordError::Malformed(format!("{} '{}' is not a date", field, raw)))
}
