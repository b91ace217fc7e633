//! Remote fetch collaborator.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::path::{Path, PathBuf};

use super::keys::RecordKind;
use crate::records::Scope;

/// Source of ledger rows for a scope.
///
/// Rows come back untyped; validation happens during reconciliation so one
/// bad row cannot sink the batch.
pub trait RecordFetcher: Send + Sync {
  fn fetch_records<'a>(&'a self, kind: RecordKind, scope: &'a Scope) -> BoxFuture<'a, Result<Vec<Value>>>;
}

/// Reads ledger exports from `{export_dir}/{kind}_{owner}_{period}.json`.
///
/// An export is either a JSON array of rows or an object carrying the rows
/// under `registros` or `records`.
#[derive(Debug, Clone)]
pub struct FileFetcher {
  export_dir: PathBuf,
}

impl FileFetcher {
  pub fn new(export_dir: impl Into<PathBuf>) -> Self {
    Self {
      export_dir: export_dir.into(),
    }
  }

  pub fn path_for(&self, kind: RecordKind, scope: &Scope) -> PathBuf {
    self.export_dir.join(format!(
      "{}_{}_{}.json",
      kind.as_str(),
      scope.owner_id(),
      scope.period()
    ))
  }
}

fn extract_rows(path: &Path, value: Value) -> Result<Vec<Value>> {
  match value {
    Value::Array(rows) => Ok(rows),
    Value::Object(mut map) => match map.remove("registros").or_else(|| map.remove("records")) {
      Some(Value::Array(rows)) => Ok(rows),
      _ => Err(eyre!("Export {} has no record list", path.display())),
    },
    _ => Err(eyre!("Export {} is not a record list", path.display())),
  }
}

impl RecordFetcher for FileFetcher {
  fn fetch_records<'a>(&'a self, kind: RecordKind, scope: &'a Scope) -> BoxFuture<'a, Result<Vec<Value>>> {
    let path = self.path_for(kind, scope);
    async move {
      let contents = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| eyre!("Failed to read export {}: {}", path.display(), e))?;
      let value: Value = serde_json::from_str(&contents)
        .map_err(|e| eyre!("Failed to parse export {}: {}", path.display(), e))?;
      extract_rows(&path, value)
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_path_for() {
    let fetcher = FileFetcher::new("/data/sire");
    let scope = Scope::new("20612969125", "202408").unwrap();
    assert_eq!(
      fetcher.path_for(RecordKind::Purchases, &scope),
      PathBuf::from("/data/sire/rce_20612969125_202408.json")
    );
  }

  #[test]
  fn test_extract_rows() {
    let path = Path::new("x.json");
    assert_eq!(extract_rows(path, json!([{"a": 1}])).unwrap().len(), 1);
    assert_eq!(
      extract_rows(path, json!({"registros": [{"a": 1}, {"a": 2}]}))
        .unwrap()
        .len(),
      2
    );
    assert!(extract_rows(path, json!({"other": []})).is_err());
    assert!(extract_rows(path, json!("nope")).is_err());
  }

  #[tokio::test]
  async fn test_missing_export_is_error() {
    let fetcher = FileFetcher::new("/definitely/not/here");
    let scope = Scope::new("20612969125", "202408").unwrap();
    assert!(fetcher
      .fetch_records(RecordKind::Sales, &scope)
      .await
      .is_err());
  }
}
