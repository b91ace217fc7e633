//! Cache keys for SUNAT ledger queries.

use std::fmt;

use crate::cache::InvalidateOptions;
use crate::records::Scope;

/// Electronic ledger a batch of records belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum RecordKind {
  /// Registro de Compras Electrónico
  #[value(name = "rce", alias = "purchases")]
  Purchases,
  /// Registro de Ventas e Ingresos Electrónico
  #[value(name = "rvie", alias = "sales")]
  Sales,
}

impl RecordKind {
  pub fn as_str(self) -> &'static str {
    match self {
      RecordKind::Purchases => "rce",
      RecordKind::Sales => "rvie",
    }
  }
}

impl fmt::Display for RecordKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Cache key for one ledger scope, e.g. `rce_20612969125_202408`.
///
/// Keys are kept readable (not hashed) so prefix patterns can target an
/// owner or a whole ledger.
pub fn cache_key(kind: RecordKind, scope: &Scope) -> String {
  format!("{}_{}_{}", kind.as_str(), scope.owner_id(), scope.period())
}

/// Invalidation matching every cached ledger of `kind`, narrowed to an
/// owner and then to one of its periods. A period without an owner is
/// ignored.
pub fn scope_invalidation(kind: RecordKind, owner_id: Option<&str>, period: Option<&str>) -> InvalidateOptions {
  let ids: Vec<&str> = owner_id.into_iter().chain(owner_id.and(period)).collect();
  InvalidateOptions::scope(kind.as_str(), &ids)
}
