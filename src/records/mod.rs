//! Fiscal document records: the validated ingestion shape, natural keys and
//! the persisted form.

mod api_types;
mod types;

pub use api_types::ApiRecord;
pub use types::{
  Counterpart, ExternalRecord, NaturalKey, RecordError, Scope, ScopeError, StoredRecord,
};
