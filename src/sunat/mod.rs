//! SUNAT ledger access: cache keys, the fetch collaborator and the
//! cache-first sync client.

mod cached_client;
mod fetcher;
mod keys;

pub use cached_client::{SyncClient, SyncReport};
pub use fetcher::{FileFetcher, RecordFetcher};
pub use keys::{cache_key, scope_invalidation, RecordKind};
