//! Storage for query results.
//!
//! [`ResultCache`] keeps structured results of synchronous queries in memory
//! with a per-entry TTL. [`ResultStore`] implementations hold the compressed
//! payloads written by background workers.
pub mod cache;
pub mod compress;
pub mod errors;
pub mod store;

pub use cache::ResultCache;
pub use compress::{compress, decompress};
pub use errors::{Result, StoreError};
pub use store::{InMemoryResultStore, ResultStore};
