pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod logging;
pub mod reconcile;
pub mod records;
pub mod store;
pub mod sunat;
