/// Durable cache tier: opaque string values under namespaced keys.
pub const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Reconciled fiscal documents, one row per natural key within a scope.
pub const RECORDS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stored_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id TEXT NOT NULL,
    period TEXT NOT NULL,
    document_type TEXT NOT NULL,
    series TEXT NOT NULL,
    number TEXT NOT NULL,
    data TEXT NOT NULL,
    source_revision_hash TEXT NOT NULL,
    first_seen_at TEXT NOT NULL,
    last_updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_stored_records_natural_key
    ON stored_records(owner_id, period, document_type, series, number);
"#;
